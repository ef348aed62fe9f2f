//! Quiescent-State-Based Reclamation.
//!
//! Each registered thread periodically announces that it holds no
//! references acquired before the announcement ("quiesces"). A deferred
//! destructor enqueued at global epoch `g` only runs once every thread
//! registered at that time has quiesced at least once after `g` —
//! i.e. every thread's locally observed epoch has advanced past `g`.
//!
//! Grounded in the QSBR usage contract described by
//! `concurrent_integral_map.hpp` (`quiesce()` delegate chain); the actual
//! engine inside the original toolkit lives in the closed-source `junction`
//! library and is not present in the reference pack, so the epoch-counting
//! scheme here is a from-scratch reconstruction of that documented contract,
//! not a line-for-line port.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

type Deferred = Box<dyn FnOnce() + Send>;

struct Inner {
  global_epoch: AtomicU64,
  threads: Mutex<Vec<Arc<AtomicU64>>>,
  pending: Mutex<Vec<(u64, Deferred)>>,
}

/// A quiescent-state reclaimer shared by every thread that touches a
/// container configured to use it.
#[derive(Clone)]
pub struct Qsbr {
  inner: Arc<Inner>,
}

impl Qsbr {
  /// Creates a fresh reclaimer with no registered threads and an empty
  /// deferred queue.
  #[must_use]
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        global_epoch: AtomicU64::new(0),
        threads: Mutex::new(Vec::new()),
        pending: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Registers the calling thread, returning a handle it should retain for
  /// as long as it intends to touch the guarded container. Dropping the
  /// handle deregisters the thread.
  #[must_use]
  pub fn register(&self) -> QsbrHandle {
    let local: Arc<AtomicU64> = Arc::new(AtomicU64::new(self.inner.global_epoch.load(Ordering::Acquire)));
    self.inner.threads.lock().unwrap().push(Arc::clone(&local));
    QsbrHandle {
      inner: Arc::clone(&self.inner),
      local,
    }
  }

  /// Queues `f` to run once every thread registered at this instant has
  /// quiesced at least once after this call.
  pub fn enqueue<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let gen: u64 = self.inner.global_epoch.load(Ordering::Acquire);
    self.inner.pending.lock().unwrap().push((gen, Box::new(f)));
  }

  /// Convenience for `enqueue(move || deleter(ptr))`.
  ///
  /// # Safety
  ///
  /// `ptr` must remain a valid argument for `deleter` until reclamation
  /// runs, i.e. no other code may free or reuse the pointee in the
  /// meantime.
  pub unsafe fn reclaim_via_callable<T, D>(&self, deleter: D, ptr: *mut T)
  where
    T: 'static,
    D: FnOnce(*mut T) + Send + 'static,
  {
    let addr: usize = ptr as usize;
    self.enqueue(move || deleter(addr as *mut T));
  }

  /// Runs every deferred callback that every currently-registered thread
  /// has quiesced past. Safe to call from any thread; typically called
  /// periodically or at the end of a bulk operation.
  pub fn flush(&self) {
    let min_epoch: u64 = {
      let threads = self.inner.threads.lock().unwrap();
      threads
        .iter()
        .map(|local| local.load(Ordering::Acquire))
        .min()
        .unwrap_or(u64::MAX)
    };

    let ready: Vec<Deferred> = {
      let mut pending = self.inner.pending.lock().unwrap();
      let (keep, take): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
        .into_iter()
        .partition(|(gen, _)| *gen >= min_epoch);
      *pending = keep;
      take.into_iter().map(|(_, f)| f).collect()
    };

    for callback in ready {
      callback();
    }
  }
}

impl Default for Qsbr {
  fn default() -> Self {
    Self::new()
  }
}

/// A per-thread registration handle. Call [`QsbrHandle::quiesce`]
/// periodically (e.g. between units of work) to advance this thread's
/// observed epoch and unblock pending reclamations.
pub struct QsbrHandle {
  inner: Arc<Inner>,
  local: Arc<AtomicU64>,
}

impl QsbrHandle {
  /// Announces that this thread currently holds no references acquired
  /// before this call.
  pub fn quiesce(&self) {
    let advanced: u64 = self.inner.global_epoch.fetch_add(1, Ordering::AcqRel) + 1;
    self.local.store(advanced, Ordering::Release);
  }
}

impl Drop for QsbrHandle {
  fn drop(&mut self) {
    let mut threads = self.inner.threads.lock().unwrap();
    if let Some(pos) = threads.iter().position(|local| Arc::ptr_eq(local, &self.local)) {
      threads.swap_remove(pos);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn deferred_runs_after_quiesce() {
    let qsbr: Qsbr = Qsbr::new();
    let handle: QsbrHandle = qsbr.register();
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let c: Arc<AtomicUsize> = Arc::clone(&counter);
    qsbr.enqueue(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });

    qsbr.flush();
    assert_eq!(counter.load(Ordering::Relaxed), 0, "no thread has quiesced yet");

    handle.quiesce();
    qsbr.flush();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn multiple_threads_must_all_quiesce() {
    let qsbr: Qsbr = Qsbr::new();
    let handle_a: QsbrHandle = qsbr.register();
    let handle_b: QsbrHandle = qsbr.register();
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let c: Arc<AtomicUsize> = Arc::clone(&counter);
    qsbr.enqueue(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });

    handle_a.quiesce();
    qsbr.flush();
    assert_eq!(counter.load(Ordering::Relaxed), 0, "b has not quiesced");

    handle_b.quiesce();
    qsbr.flush();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn dropped_handle_stops_blocking_reclamation() {
    let qsbr: Qsbr = Qsbr::new();
    let handle_a: QsbrHandle = qsbr.register();
    let handle_b: QsbrHandle = qsbr.register();
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let c: Arc<AtomicUsize> = Arc::clone(&counter);
    qsbr.enqueue(move || {
      c.fetch_add(1, Ordering::Relaxed);
    });

    handle_a.quiesce();
    drop(handle_b);
    qsbr.flush();
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }
}
