//! Ref-counted node manager: a mutex-guarded pending list drained as soon
//! as the live checkout count drops to zero, with an atomic fast path so
//! [`add`](RefCountedNodeManager::add) skips the lock entirely when there
//! is nothing pending.
//!
//! Grounded in `ref_count_node_manager.hpp`, itself derived from the
//! node-recycling scheme in folly's `ConcurrentSkipList`: a plain atomic
//! refcount (no pointer packing, unlike [`super::rcr`]) guards a
//! `Mutex`-protected vector of deferred callbacks.

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

type Deferred = Box<dyn FnOnce() + Send>;

/// A checkout-counted deferred-reclamation list.
pub struct RefCountedNodeManager {
  refs: AtomicUsize,
  has_pending: AtomicBool,
  pending: Mutex<Vec<Deferred>>,
}

impl RefCountedNodeManager {
  /// Creates an empty manager with no outstanding checkouts.
  #[must_use]
  pub fn new() -> Self {
    Self {
      refs: AtomicUsize::new(0),
      has_pending: AtomicBool::new(false),
      pending: Mutex::new(Vec::new()),
    }
  }

  /// Takes a checkout, deferring any drain triggered by [`add`](Self::add)
  /// until the returned guard (and every other live checkout) is dropped.
  #[must_use]
  pub fn checkout(&self) -> Checkout<'_> {
    self.refs.fetch_add(1, Ordering::AcqRel);
    Checkout { manager: self }
  }

  /// Queues `f`, running it immediately if no checkout is currently live.
  pub fn add<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    {
      let mut pending = self.pending.lock().unwrap();
      pending.push(Box::new(f));
      self.has_pending.store(true, Ordering::Release);
    }
    self.try_drain();
  }

  fn try_drain(&self) {
    if !self.has_pending.load(Ordering::Acquire) {
      return;
    }
    if self.refs.load(Ordering::Acquire) != 0 {
      return;
    }

    let drained: Vec<Deferred> = {
      let mut pending = self.pending.lock().unwrap();
      if self.refs.load(Ordering::Acquire) != 0 {
        return;
      }
      self.has_pending.store(false, Ordering::Release);
      std::mem::take(&mut *pending)
    };

    for callback in drained {
      callback();
    }
  }

  fn release(&self) {
    let previous: usize = self.refs.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous >= 1, "release with no outstanding checkout");
    if previous == 1 {
      self.try_drain();
    }
  }
}

impl Default for RefCountedNodeManager {
  fn default() -> Self {
    Self::new()
  }
}

/// A live checkout against a [`RefCountedNodeManager`]. Dropping it
/// releases the checkout, draining the pending list if this was the last
/// one outstanding.
pub struct Checkout<'a> {
  manager: &'a RefCountedNodeManager,
}

impl Drop for Checkout<'_> {
  fn drop(&mut self) {
    self.manager.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize as AU;
  use std::thread;

  #[test]
  fn runs_immediately_with_no_checkouts() {
    let manager = RefCountedNodeManager::new();
    let counter: Arc<AU> = Arc::new(AU::new(0));
    let c: Arc<AU> = Arc::clone(&counter);
    manager.add(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn defers_until_checkout_released() {
    let manager = RefCountedNodeManager::new();
    let counter: Arc<AU> = Arc::new(AU::new(0));
    let held: Checkout<'_> = manager.checkout();

    let c: Arc<AU> = Arc::clone(&counter);
    manager.add(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(counter.load(Ordering::Relaxed), 0);

    drop(held);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn concurrent_checkouts_and_adds() {
    let manager: Arc<RefCountedNodeManager> = Arc::new(RefCountedNodeManager::new());
    let counter: Arc<AU> = Arc::new(AU::new(0));

    thread::scope(|scope| {
      for _ in 0..8 {
        let manager: Arc<RefCountedNodeManager> = Arc::clone(&manager);
        let counter: Arc<AU> = Arc::clone(&counter);
        scope.spawn(move || {
          for _ in 0..200 {
            let held: Checkout<'_> = manager.checkout();
            let c: Arc<AU> = Arc::clone(&counter);
            manager.add(move || {
              c.fetch_add(1, Ordering::Relaxed);
            });
            drop(held);
          }
        });
      }
    });

    manager.try_drain();
    assert_eq!(counter.load(Ordering::Relaxed), 1600);
  }
}
