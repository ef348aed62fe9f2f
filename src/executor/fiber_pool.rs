//! A cooperative, work-stealing "fiber" executor multiplexed over a small
//! number of OS threads.
//!
//! Grounded in `work_stealing_fiber_pool.hpp`'s polling contract: each OS
//! thread round-robins a fixed set of fiber slots, draining its local
//! queue, then the shared queue, then stealing from a randomized peer,
//! before it is allowed to go idle. No stackful-coroutine crate is
//! available in the reference pack (the original sits on `boost::fiber`),
//! so a "fiber" here is a plain `FnOnce` job driven to completion in one
//! poll rather than a true suspendable coroutine — see `DESIGN.md`'s
//! "Coroutines vs. fibers" note. The externally observable contract
//! (polling order, `suspend_polling`/`resume_polling`, the "no outstanding
//! tasks" precondition) is preserved regardless.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::mpmc::BoundedQueue;
use crate::util::rng::with_thread_rng;

type FiberJob = Box<dyn FnOnce() + Send + 'static>;

const QUEUE_CAPACITY: usize = 1024;
const SPIN_LIMIT: u32 = 64;
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

thread_local! {
  static CURRENT_FIBER_THREAD: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Returns `1..=M` inside a fiber pool's OS thread, `0` everywhere else.
#[must_use]
pub fn get_fiber_thread_id() -> usize {
  CURRENT_FIBER_THREAD.with(std::cell::Cell::get)
}

/// Construction options for a [`FiberPool`].
pub struct FiberPoolOptions {
  /// Number of OS threads hosting the cooperative schedulers. Must be at
  /// least two.
  pub os_threads: usize,
  /// Number of fiber slots each OS thread round-robins over.
  pub fibers_per_thread: usize,
}

impl Default for FiberPoolOptions {
  fn default() -> Self {
    Self {
      os_threads: thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(2).max(2),
      fibers_per_thread: 4,
    }
  }
}

/// A cooperative executor: `M` OS threads, each multiplexing `K` fiber
/// slots in round-robin order, with work-stealing across threads when a
/// thread's own slots and the shared queue are both empty.
pub struct FiberPool {
  shared_queue: Arc<BoundedQueue<FiberJob>>,
  locals: Vec<Arc<BoundedQueue<FiberJob>>>,
  fibers_per_thread: usize,
  done: Arc<AtomicBool>,
  suspended: Arc<AtomicBool>,
  parked: Arc<(Mutex<()>, Condvar)>,
  workers: Vec<thread::JoinHandle<()>>,
}

impl FiberPool {
  /// Creates a pool of `os_threads` threads, each multiplexing
  /// `fibers_per_thread` fiber slots.
  ///
  /// # Panics
  ///
  /// Panics (via `assert!`) if `os_threads < 2`: a single-threaded fiber
  /// pool has nowhere to steal from and the original toolkit rejects the
  /// configuration the same way.
  #[must_use]
  pub fn new(os_threads: usize, fibers_per_thread: usize) -> Self {
    Self::with_options(FiberPoolOptions {
      os_threads,
      fibers_per_thread,
    })
  }

  /// Creates a pool per the given options. Same precondition as [`new`](Self::new).
  #[must_use]
  pub fn with_options(options: FiberPoolOptions) -> Self {
    assert!(options.os_threads >= 2, "fiber pool requires at least two OS threads");
    let fibers_per_thread: usize = options.fibers_per_thread.max(1);

    let shared_queue: Arc<BoundedQueue<FiberJob>> = Arc::new(BoundedQueue::with_capacity(QUEUE_CAPACITY));
    let locals: Vec<Arc<BoundedQueue<FiberJob>>> = (0..options.os_threads).map(|_| Arc::new(BoundedQueue::with_capacity(QUEUE_CAPACITY))).collect();
    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let suspended: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let parked: Arc<(Mutex<()>, Condvar)> = Arc::new((Mutex::new(()), Condvar::new()));

    let workers: Vec<thread::JoinHandle<()>> = (0..options.os_threads)
      .map(|index| {
        let shared_queue: Arc<BoundedQueue<FiberJob>> = Arc::clone(&shared_queue);
        let locals: Vec<Arc<BoundedQueue<FiberJob>>> = locals.clone();
        let done: Arc<AtomicBool> = Arc::clone(&done);
        let suspended: Arc<AtomicBool> = Arc::clone(&suspended);
        let parked: Arc<(Mutex<()>, Condvar)> = Arc::clone(&parked);
        thread::Builder::new()
          .name(format!("stk-fiber-{index}"))
          .spawn(move || fiber_thread_loop(index, fibers_per_thread, locals, shared_queue, done, suspended, parked))
          .expect("failed to spawn fiber OS thread")
      })
      .collect();

    Self {
      shared_queue,
      locals,
      fibers_per_thread,
      done,
      suspended,
      parked,
      workers,
    }
  }

  /// The number of OS threads hosting fiber schedulers.
  #[must_use]
  pub fn number_threads(&self) -> usize {
    self.workers.len()
  }

  /// The number of fiber slots multiplexed per OS thread.
  #[must_use]
  pub fn number_fibers(&self) -> usize {
    self.fibers_per_thread
  }

  /// Queues `f` onto the calling OS thread's local queue if called from
  /// inside the pool, else onto the shared queue.
  pub fn send<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let idx: usize = get_fiber_thread_id();
    let target: &Arc<BoundedQueue<FiberJob>> = if idx > 0 { &self.locals[idx - 1] } else { &self.shared_queue };
    let mut job: FiberJob = Box::new(f);
    loop {
      match target.try_push(job) {
        Ok(()) => break,
        Err(returned) => {
          job = returned;
          thread::yield_now();
        }
      }
    }
    let (_, cvar) = &*self.parked;
    cvar.notify_all();
  }

  /// Puts every OS thread to sleep on a condition variable rather than
  /// polling. The caller must ensure no outstanding tasks are queued
  /// (checked with a debug assertion here).
  pub fn suspend_polling(&self) {
    debug_assert!(
      self.shared_queue.is_empty() && self.locals.iter().all(|queue| queue.is_empty()),
      "suspend_polling called with outstanding tasks still queued"
    );
    self.suspended.store(true, Ordering::Release);
  }

  /// Wakes every OS thread from [`suspend_polling`](Self::suspend_polling).
  pub fn resume_polling(&self) {
    self.suspended.store(false, Ordering::Release);
    let (_, cvar) = &*self.parked;
    cvar.notify_all();
  }
}

impl Drop for FiberPool {
  fn drop(&mut self) {
    self.done.store(true, Ordering::Release);
    let (_, cvar) = &*self.parked;
    cvar.notify_all();
    for handle in self.workers.drain(..) {
      let _ = handle.join();
    }
  }
}

fn steal_from_peer(own_index: usize, locals: &[Arc<BoundedQueue<FiberJob>>]) -> Option<FiberJob> {
  if locals.len() <= 1 {
    return None;
  }
  let start: usize = with_thread_rng(|rng| rng.next_below(locals.len() as u32) as usize);
  for offset in 0..locals.len() {
    let victim: usize = (start + offset) % locals.len();
    if victim == own_index {
      continue;
    }
    if let Some(job) = locals[victim].try_steal() {
      return Some(job);
    }
  }
  None
}

#[allow(clippy::too_many_arguments)]
fn fiber_thread_loop(
  index: usize,
  fibers_per_thread: usize,
  locals: Vec<Arc<BoundedQueue<FiberJob>>>,
  shared: Arc<BoundedQueue<FiberJob>>,
  done: Arc<AtomicBool>,
  suspended: Arc<AtomicBool>,
  parked: Arc<(Mutex<()>, Condvar)>,
) {
  CURRENT_FIBER_THREAD.with(|id| id.set(index + 1));

  let mut idle_spins: u32 = 0;
  loop {
    let mut ran_any: bool = false;
    for _slot in 0..fibers_per_thread {
      let claimed: Option<FiberJob> = locals[index]
        .try_pop()
        .or_else(|| shared.try_pop())
        .or_else(|| steal_from_peer(index, &locals));

      match claimed {
        Some(job) => {
          job();
          ran_any = true;
        }
        None => break,
      }
    }

    if ran_any {
      idle_spins = 0;
      continue;
    }

    if done.load(Ordering::Acquire) {
      break;
    }

    if suspended.load(Ordering::Acquire) {
      let (lock, cvar) = &*parked;
      let guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      let _ = cvar.wait_timeout(guard, PARK_TIMEOUT);
      continue;
    }

    if idle_spins < SPIN_LIMIT {
      std::hint::spin_loop();
      idle_spins += 1;
    } else {
      let (lock, cvar) = &*parked;
      let guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      let _ = cvar.wait_timeout(guard, PARK_TIMEOUT);
      idle_spins = 0;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;

  #[test]
  #[should_panic(expected = "at least two OS threads")]
  fn rejects_single_thread_configuration() {
    FiberPool::new(1, 4);
  }

  #[test]
  fn send_runs_every_job() {
    let pool: FiberPool = FiberPool::new(2, 4);
    let seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
    for i in 0..50 {
      let seen: Arc<StdMutex<Vec<u32>>> = Arc::clone(&seen);
      pool.send(move || {
        seen.lock().unwrap().push(i);
      });
    }
    // Give the cooperative schedulers a chance to drain; poll rather than
    // sleep a fixed duration to keep this test fast and non-flaky.
    loop {
      if seen.lock().unwrap().len() == 50 {
        break;
      }
      thread::yield_now();
    }
    let mut values: Vec<u32> = seen.lock().unwrap().clone();
    values.sort_unstable();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
  }

  #[test]
  fn suspend_and_resume_round_trip() {
    let pool: FiberPool = FiberPool::new(2, 2);
    pool.suspend_polling();
    pool.resume_polling();
    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let done_for_job: Arc<AtomicBool> = Arc::clone(&done);
    pool.send(move || done_for_job.store(true, Ordering::Release));
    while !done.load(Ordering::Acquire) {
      thread::yield_now();
    }
  }

  #[test]
  fn number_threads_and_fibers_report_configuration() {
    let pool: FiberPool = FiberPool::new(3, 5);
    assert_eq!(pool.number_threads(), 3);
    assert_eq!(pool.number_fibers(), 5);
  }
}
