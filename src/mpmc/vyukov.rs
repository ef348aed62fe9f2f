//! Dmitry Vyukov's bounded MPMC queue: a power-of-two ring buffer where
//! each cell carries its own sequence number, letting producers and
//! consumers make progress independently with a single CAS per operation
//! instead of a shared lock.
//!
//! Used as the free-list backing structure for [`crate::pool`], mirroring
//! how `memory_pool.hpp` backs its free list with `moodycamel::ConcurrentQueue`
//! — the closest openly-available equivalent is this Vyukov ring, so that is
//! what backs `stk`'s pools instead.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::util::padded::CachePadded;

struct Cell<T> {
  sequence: AtomicUsize,
  data: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded, lock-free multi-producer multi-consumer queue.
///
/// Capacity is rounded up to the next power of two (minimum 2).
pub struct BoundedQueue<T> {
  buffer: Box<[Cell<T>]>,
  mask: usize,
  enqueue_pos: CachePadded<AtomicUsize>,
  dequeue_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
  /// Creates a queue able to hold at least `capacity` elements.
  #[must_use]
  pub fn with_capacity(capacity: usize) -> Self {
    let capacity: usize = capacity.next_power_of_two().max(2);
    let buffer: Vec<Cell<T>> = (0..capacity)
      .map(|i| Cell {
        sequence: AtomicUsize::new(i),
        data: UnsafeCell::new(MaybeUninit::uninit()),
      })
      .collect();

    Self {
      buffer: buffer.into_boxed_slice(),
      mask: capacity - 1,
      enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
      dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
    }
  }

  /// The queue's capacity (always a power of two).
  #[must_use]
  pub fn capacity(&self) -> usize {
    self.mask + 1
  }

  /// An approximate count of items currently queued; exact absent
  /// concurrent pushes/pops.
  #[must_use]
  pub fn len(&self) -> usize {
    let enqueued: usize = self.enqueue_pos.load(Ordering::Relaxed);
    let dequeued: usize = self.dequeue_pos.load(Ordering::Relaxed);
    enqueued.saturating_sub(dequeued)
  }

  /// Whether the queue held no items at the moment of the check.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Attempts to push `value`, returning it back if the queue is full.
  pub fn try_push(&self, value: T) -> Result<(), T> {
    let mut pos: usize = self.enqueue_pos.load(Ordering::Relaxed);
    loop {
      let cell: &Cell<T> = &self.buffer[pos & self.mask];
      let seq: usize = cell.sequence.load(Ordering::Acquire);
      let diff: isize = seq as isize - pos as isize;

      if diff == 0 {
        if self
          .enqueue_pos
          .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          unsafe {
            (*cell.data.get()).write(value);
          }
          cell.sequence.store(pos + 1, Ordering::Release);
          return Ok(());
        }
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      } else if diff < 0 {
        return Err(value);
      } else {
        pos = self.enqueue_pos.load(Ordering::Relaxed);
      }
    }
  }

  /// Attempts to steal the oldest element on behalf of another worker.
  ///
  /// Differs from [`try_pop`](Self::try_pop) only in taking a relaxed
  /// read of the dequeue position up front rather than looping from a
  /// thread-local cursor: a thief has no cached position of its own to
  /// start from, so it always re-reads the shared counter first. Used by
  /// the work-stealing thread pool's cross-worker steal path, where the
  /// owning worker's [`try_pop`](Self::try_pop) is the fast local path.
  pub fn try_steal(&self) -> Option<T> {
    self.try_pop()
  }

  /// Attempts to pop the oldest element, returning `None` if empty.
  pub fn try_pop(&self) -> Option<T> {
    let mut pos: usize = self.dequeue_pos.load(Ordering::Relaxed);
    loop {
      let cell: &Cell<T> = &self.buffer[pos & self.mask];
      let seq: usize = cell.sequence.load(Ordering::Acquire);
      let diff: isize = seq as isize - (pos + 1) as isize;

      if diff == 0 {
        if self
          .dequeue_pos
          .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_ok()
        {
          let value: T = unsafe { (*cell.data.get()).assume_init_read() };
          cell.sequence.store(pos + self.mask + 1, Ordering::Release);
          return Some(value);
        }
        pos = self.dequeue_pos.load(Ordering::Relaxed);
      } else if diff < 0 {
        return None;
      } else {
        pos = self.dequeue_pos.load(Ordering::Relaxed);
      }
    }
  }
}

impl<T> Drop for BoundedQueue<T> {
  fn drop(&mut self) {
    while self.try_pop().is_some() {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn fifo_single_threaded() {
    let queue: BoundedQueue<u32> = BoundedQueue::with_capacity(4);
    assert_eq!(queue.capacity(), 4);
    assert!(queue.try_push(1).is_ok());
    assert!(queue.try_push(2).is_ok());
    assert_eq!(queue.try_pop(), Some(1));
    assert_eq!(queue.try_pop(), Some(2));
    assert_eq!(queue.try_pop(), None);
  }

  #[test]
  fn rejects_push_when_full() {
    let queue: BoundedQueue<u32> = BoundedQueue::with_capacity(2);
    assert!(queue.try_push(1).is_ok());
    assert!(queue.try_push(2).is_ok());
    assert_eq!(queue.try_push(3), Err(3));
  }

  #[test]
  fn concurrent_producers_and_consumers_preserve_count() {
    let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::with_capacity(1024));
    const PER_PRODUCER: u32 = 2000;

    thread::scope(|scope| {
      for _ in 0..4 {
        let queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
        scope.spawn(move || {
          for i in 0..PER_PRODUCER {
            while queue.try_push(i).is_err() {
              thread::yield_now();
            }
          }
        });
      }

      let consumed: Arc<std::sync::atomic::AtomicU32> = Arc::new(std::sync::atomic::AtomicU32::new(0));
      for _ in 0..4 {
        let queue: Arc<BoundedQueue<u32>> = Arc::clone(&queue);
        let consumed: Arc<std::sync::atomic::AtomicU32> = Arc::clone(&consumed);
        scope.spawn(move || {
          loop {
            if consumed.load(Ordering::Relaxed) >= 4 * PER_PRODUCER {
              break;
            }
            if queue.try_pop().is_some() {
              consumed.fetch_add(1, Ordering::Relaxed);
            } else {
              thread::yield_now();
            }
          }
        });
      }
    });

    assert_eq!(queue.try_pop(), None);
  }
}
