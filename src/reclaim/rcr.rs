//! Reference-counted reclamation.
//!
//! Packs a deferred-callback list head and a live-checkout count into a
//! single [`AtomicStampedPtr`] word, mirroring how
//! `ref_count_memory_reclaimer.hpp` packs `(queue*, refcount)` so both can
//! move together in one CAS. A checkout increments the count; releasing the
//! last outstanding checkout swaps the whole list out and runs every queued
//! callback.
//!
//! [`RefCountedReclaimer::add`] takes its own checkout for the duration of
//! the push so that a reclamation racing in on another thread can never
//! drain a list out from under the very callback being added — this is the
//! documented resolution for the "does `add` need an ambient checkout"
//! open question: no, it brackets one itself.

use std::ptr;
use std::sync::atomic::Ordering;

use crate::tap::AtomicStampedPtr;

type Callback = Box<dyn FnOnce() + Send>;

struct Node {
  next: *mut Node,
  callback: Callback,
}

unsafe impl Send for Node {}

/// A reference-counted deferred-reclamation queue.
///
/// Readers bracket their critical section with [`checkout`](Self::checkout);
/// the callback queued by [`add`](Self::add) only runs once every
/// outstanding checkout taken before the drain has been released.
pub struct RefCountedReclaimer {
  head: AtomicStampedPtr<Node>,
}

impl RefCountedReclaimer {
  /// Creates an empty reclaimer with no outstanding checkouts.
  #[must_use]
  pub fn new() -> Self {
    Self {
      head: AtomicStampedPtr::null(),
    }
  }

  /// Takes a checkout, preventing any callback queued before this call from
  /// running until the returned guard (and every other live checkout) is
  /// dropped.
  #[must_use]
  pub fn checkout(&self) -> Checkout<'_> {
    loop {
      let (ptr, count) = self.head.load(Ordering::Acquire);
      let next_count: u16 = count.wrapping_add(1);
      if self
        .head
        .compare_exchange_weak(ptr, count, ptr, next_count, Ordering::AcqRel)
        .is_ok()
      {
        return Checkout { reclaimer: self };
      }
      std::hint::spin_loop();
    }
  }

  /// Queues `f` to run once every checkout live at this instant (including
  /// the one this call takes internally) has been released.
  pub fn add<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let _guard: Checkout<'_> = self.checkout();
    let node: *mut Node = Box::into_raw(Box::new(Node {
      next: ptr::null_mut(),
      callback: Box::new(f),
    }));

    loop {
      let (head_ptr, count) = self.head.load(Ordering::Acquire);
      unsafe {
        (*node).next = head_ptr;
      }
      if self
        .head
        .compare_exchange_weak(head_ptr, count, node, count, Ordering::AcqRel)
        .is_ok()
      {
        break;
      }
      std::hint::spin_loop();
    }
  }

  fn release(&self) {
    loop {
      let (head_ptr, count) = self.head.load(Ordering::Acquire);
      debug_assert!(count > 0, "release with no outstanding checkout");
      let next_count: u16 = count - 1;

      if next_count == 0 {
        if self
          .head
          .compare_exchange_weak(head_ptr, count, ptr::null_mut(), 0, Ordering::AcqRel)
          .is_ok()
        {
          drain(head_ptr);
          return;
        }
      } else if self
        .head
        .compare_exchange_weak(head_ptr, count, head_ptr, next_count, Ordering::AcqRel)
        .is_ok()
      {
        return;
      }
      std::hint::spin_loop();
    }
  }
}

impl Default for RefCountedReclaimer {
  fn default() -> Self {
    Self::new()
  }
}

fn drain(mut node: *mut Node) {
  while !node.is_null() {
    let owned: Box<Node> = unsafe { Box::from_raw(node) };
    node = owned.next;
    (owned.callback)();
  }
}

/// A live checkout against a [`RefCountedReclaimer`]. Dropping it releases
/// the checkout, draining the deferred list if this was the last one.
pub struct Checkout<'a> {
  reclaimer: &'a RefCountedReclaimer,
}

impl Drop for Checkout<'_> {
  fn drop(&mut self) {
    self.reclaimer.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::thread;

  #[test]
  fn drains_once_last_checkout_released() {
    let reclaimer = RefCountedReclaimer::new();
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let held: Checkout<'_> = reclaimer.checkout();

    let c: Arc<AtomicUsize> = Arc::clone(&counter);
    reclaimer.add(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(counter.load(Ordering::Relaxed), 0, "outer checkout still held");
    drop(held);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn concurrent_checkouts_and_adds() {
    let reclaimer: Arc<RefCountedReclaimer> = Arc::new(RefCountedReclaimer::new());
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
      for _ in 0..8 {
        let reclaimer: Arc<RefCountedReclaimer> = Arc::clone(&reclaimer);
        let counter: Arc<AtomicUsize> = Arc::clone(&counter);
        scope.spawn(move || {
          for _ in 0..200 {
            let c: Arc<AtomicUsize> = Arc::clone(&counter);
            reclaimer.add(move || {
              c.fetch_add(1, Ordering::Relaxed);
            });
          }
        });
      }
    });

    assert_eq!(counter.load(Ordering::Relaxed), 1600);
  }
}
