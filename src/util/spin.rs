//! A tiny spin lock with bounded-yield backoff, used for per-node locking
//! in the lock-based skip list and for short reclamation hand-off sections.
//!
//! Grounded in `tiny_atomic_spin_lock.hpp` / `std_yield_wait_strategies.hpp`:
//! spin a short bounded number of times, then fall back to `thread::yield_now`.

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::ops::DerefMut;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;

/// Number of bare spin iterations attempted before yielding to the OS
/// scheduler. Mirrors the `eager_std_thread_yield_wait<64>` backoff used by
/// the original's `tiny_atomic_spin_lock`.
const SPIN_LIMIT: u32 = 64;

/// A minimal mutual-exclusion lock backed by a single `AtomicBool`.
///
/// Unlike `std::sync::Mutex`, this lock never parks the OS thread; callers
/// needing longer critical sections should prefer a blocking mutex instead.
#[derive(Debug, Default)]
pub struct SpinLock<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
  #[inline]
  pub const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  /// Acquires the lock, spinning and then yielding until it is free.
  #[inline]
  pub fn lock(&self) -> SpinGuard<'_, T> {
    let mut spins: u32 = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      if spins < SPIN_LIMIT {
        core::hint::spin_loop();
        spins += 1;
      } else {
        std::thread::yield_now();
      }
    }
    SpinGuard { lock: self }
  }

  /// Attempts to acquire the lock without blocking.
  #[inline]
  pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| SpinGuard { lock: self })
  }
}

/// RAII guard releasing a [`SpinLock`] when dropped.
#[derive(Debug)]
pub struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    // SAFETY: holding the guard proves exclusive access to `value`.
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: holding the guard proves exclusive access to `value`.
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn mutual_exclusion() {
    let lock: Arc<SpinLock<u64>> = Arc::new(SpinLock::new(0));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let lock: Arc<SpinLock<u64>> = Arc::clone(&lock);
        thread::spawn(move || {
          for _ in 0..1000 {
            *lock.lock() += 1;
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(*lock.lock(), 8000);
  }

  #[test]
  fn try_lock_contends() {
    let lock: SpinLock<u32> = SpinLock::new(1);
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.try_lock().is_some());
  }
}
