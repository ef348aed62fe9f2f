//! A work-stealing thread pool: each worker drains its own local queue,
//! then the shared queue, then steals from a randomized peer, backing off
//! to a condition variable when every queue comes up empty.
//!
//! Grounded in `thread_pool.hpp`'s worker poll loop. The original resolves
//! `send`'s result through a packaged-task-style future; this crate has no
//! futures-ecosystem dependency (the rest of the toolkit's stack is
//! deliberately minimal, per `Cargo.toml`), so [`JoinHandle`] is a small
//! hand-rolled `Mutex`/`Condvar` rendezvous instead — `send_no_future`
//! bypasses it entirely, exactly as in source.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::mpmc::BoundedQueue;
use crate::util::rng::with_thread_rng;

type Job = Box<dyn FnOnce() + Send + 'static>;

const QUEUE_CAPACITY: usize = 1024;
const SPIN_LIMIT: u32 = 64;
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

thread_local! {
  static CURRENT_THREAD_ID: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Returns `1..=N` inside a pool worker, `0` everywhere else. The
/// canonical way to key per-thread state — never key off the OS thread id.
#[must_use]
pub fn get_thread_id() -> usize {
  CURRENT_THREAD_ID.with(std::cell::Cell::get)
}

struct Rendezvous<T> {
  value: Mutex<Option<T>>,
  ready: Condvar,
}

/// A handle to a task submitted via [`ThreadPool::send`], resolved once
/// the task's body has run.
pub struct JoinHandle<T> {
  shared: Arc<Rendezvous<T>>,
}

impl<T> JoinHandle<T> {
  /// Whether the task has finished without blocking to find out.
  #[must_use]
  pub fn is_ready(&self) -> bool {
    self.shared.value.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_some()
  }

  /// Blocks until the task completes and returns its result.
  #[must_use]
  pub fn wait(self) -> T {
    let mut guard = self.shared.value.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    while guard.is_none() {
      guard = self.shared.ready.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner);
    }
    guard.take().expect("checked Some above")
  }
}

/// Hooks run on every worker thread's entry and exit.
#[derive(Clone, Default)]
pub struct ThreadHooks {
  pub on_thread_start: Option<Arc<dyn Fn(usize) + Send + Sync>>,
  pub on_thread_stop: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

/// Construction options for a [`ThreadPool`].
pub struct ThreadPoolOptions {
  pub threads: usize,
  pub hooks: ThreadHooks,
}

impl Default for ThreadPoolOptions {
  fn default() -> Self {
    Self {
      threads: thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1),
      hooks: ThreadHooks::default(),
    }
  }
}

/// A work-stealing executor over `N` worker threads.
pub struct ThreadPool {
  shared_queue: Arc<BoundedQueue<Job>>,
  locals: Vec<Arc<BoundedQueue<Job>>>,
  done: Arc<AtomicBool>,
  parked: Arc<(Mutex<()>, Condvar)>,
  workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
  /// Creates a pool with `threads` workers, default hooks.
  #[must_use]
  pub fn new(threads: usize) -> Self {
    Self::with_options(ThreadPoolOptions {
      threads,
      ..ThreadPoolOptions::default()
    })
  }

  /// Creates a pool per the given options.
  #[must_use]
  pub fn with_options(options: ThreadPoolOptions) -> Self {
    let threads: usize = options.threads.max(1);
    let shared_queue: Arc<BoundedQueue<Job>> = Arc::new(BoundedQueue::with_capacity(QUEUE_CAPACITY));
    let locals: Vec<Arc<BoundedQueue<Job>>> = (0..threads).map(|_| Arc::new(BoundedQueue::with_capacity(QUEUE_CAPACITY))).collect();
    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let parked: Arc<(Mutex<()>, Condvar)> = Arc::new((Mutex::new(()), Condvar::new()));

    let workers: Vec<thread::JoinHandle<()>> = (0..threads)
      .map(|index| {
        let shared_queue: Arc<BoundedQueue<Job>> = Arc::clone(&shared_queue);
        let locals: Vec<Arc<BoundedQueue<Job>>> = locals.clone();
        let done: Arc<AtomicBool> = Arc::clone(&done);
        let parked: Arc<(Mutex<()>, Condvar)> = Arc::clone(&parked);
        let hooks: ThreadHooks = options.hooks.clone();
        thread::Builder::new()
          .name(format!("stk-worker-{index}"))
          .spawn(move || worker_loop(index, locals, shared_queue, done, parked, hooks))
          .expect("failed to spawn worker thread")
      })
      .collect();

    Self {
      shared_queue,
      locals,
      done,
      parked,
      workers,
    }
  }

  /// The number of worker threads.
  #[must_use]
  pub fn number_threads(&self) -> usize {
    self.workers.len()
  }

  fn dispatch(&self, job: Job) {
    let idx: usize = get_thread_id();
    let target: &Arc<BoundedQueue<Job>> = if idx > 0 { &self.locals[idx - 1] } else { &self.shared_queue };
    let mut job: Job = job;
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

  fn try_claim_any(&self) -> Option<Job> {
    let idx: usize = get_thread_id();
    if idx > 0 {
      if let Some(job) = self.locals[idx - 1].try_pop() {
        return Some(job);
      }
    }
    if let Some(job) = self.shared_queue.try_pop() {
      return Some(job);
    }
    steal_from_peer(idx, &self.locals)
  }

  /// Submits `f`, returning a handle resolved by its return value.
  pub fn send<F, R>(&self, f: F) -> JoinHandle<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let shared: Arc<Rendezvous<R>> = Arc::new(Rendezvous {
      value: Mutex::new(None),
      ready: Condvar::new(),
    });
    let shared_for_job: Arc<Rendezvous<R>> = Arc::clone(&shared);
    self.dispatch(Box::new(move || {
      let result: R = f();
      let mut guard = shared_for_job.value.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
      *guard = Some(result);
      drop(guard);
      shared_for_job.ready.notify_all();
    }));
    JoinHandle { shared }
  }

  /// Submits `f` with no result tracking. A panic inside `f` is
  /// unsupported: the pool makes no attempt to catch it.
  pub fn send_no_future<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.dispatch(Box::new(f));
  }

  /// Partitions `range` into roughly `threads · (threads - 1)` chunks and
  /// dispatches each, blocking the caller (while helping drain the pool)
  /// until every chunk completes.
  pub fn parallel_for<F>(&self, range: std::ops::Range<usize>, f: F)
  where
    F: Fn(usize) + Send + Sync + 'static,
  {
    let total: usize = range.end.saturating_sub(range.start);
    if total == 0 {
      return;
    }
    let threads: usize = self.number_threads().max(1);
    let chunk_count: usize = (threads * threads.saturating_sub(1)).clamp(1, total);
    let chunk_len: usize = total.div_ceil(chunk_count);
    let f: Arc<F> = Arc::new(f);

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(chunk_count);
    let mut start: usize = range.start;
    while start < range.end {
      let end: usize = (start + chunk_len).min(range.end);
      let f: Arc<F> = Arc::clone(&f);
      handles.push(self.send(move || {
        for i in start..end {
          f(i);
        }
      }));
      start = end;
    }
    self.wait_or_work(&handles);
  }

  /// The index-parameterized form of [`parallel_for`](Self::parallel_for):
  /// equivalent to `parallel_for(0..n, f)`.
  pub fn parallel_apply<F>(&self, n: usize, f: F)
  where
    F: Fn(usize) + Send + Sync + 'static,
  {
    self.parallel_for(0..n, f);
  }

  /// Executes queued pool work on the calling thread until every handle in
  /// `handles` is ready. Prevents deadlock when a task run by this pool is
  /// itself waiting on another pool task.
  pub fn wait_or_work<T>(&self, handles: &[JoinHandle<T>]) {
    loop {
      if handles.iter().all(JoinHandle::is_ready) {
        return;
      }
      if !self.try_run_one() {
        thread::yield_now();
      }
    }
  }

  /// Claims and runs a single queued job on the calling thread, returning
  /// whether one was found. Lets callers outside `send`/`wait_or_work`
  /// (the task graph's [`wait`](crate::executor::task_graph::TaskGraph::wait))
  /// help drain the pool while blocked on a dependency.
  pub(crate) fn try_run_one(&self) -> bool {
    match self.try_claim_any() {
      Some(job) => {
        job();
        true
      }
      None => false,
    }
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    self.done.store(true, Ordering::Release);
    let (_, cvar) = &*self.parked;
    cvar.notify_all();
    for handle in self.workers.drain(..) {
      let _ = handle.join();
    }
  }
}

fn steal_from_peer(own_index: usize, locals: &[Arc<BoundedQueue<Job>>]) -> Option<Job> {
  if locals.is_empty() {
    return None;
  }
  let start: usize = with_thread_rng(|rng| rng.next_below(locals.len() as u32) as usize);
  for offset in 0..locals.len() {
    let victim: usize = (start + offset) % locals.len();
    if own_index > 0 && victim == own_index - 1 {
      continue;
    }
    if let Some(job) = locals[victim].try_steal() {
      return Some(job);
    }
  }
  None
}

fn worker_loop(
  index: usize,
  locals: Vec<Arc<BoundedQueue<Job>>>,
  shared: Arc<BoundedQueue<Job>>,
  done: Arc<AtomicBool>,
  parked: Arc<(Mutex<()>, Condvar)>,
  hooks: ThreadHooks,
) {
  CURRENT_THREAD_ID.with(|id| id.set(index + 1));
  if let Some(on_start) = &hooks.on_thread_start {
    on_start(index + 1);
  }

  let mut idle_spins: u32 = 0;
  loop {
    let claimed: Option<Job> = locals[index].try_pop().or_else(|| shared.try_pop()).or_else(|| steal_from_peer(index + 1, &locals));

    if let Some(job) = claimed {
      idle_spins = 0;
      job();
      continue;
    }

    if done.load(Ordering::Acquire) {
      break;
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

  if let Some(on_stop) = &hooks.on_thread_stop {
    on_stop(index + 1);
  }
}
