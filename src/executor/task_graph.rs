//! Dependency-aware task submission atop a [`ThreadPool`].
//!
//! Grounded in `task_system.hpp`'s `basic_task`: a task carries a
//! dependency counter, a refcount, a completion flag, and a continuation
//! list guarded by a tiny spin lock. Attaching a continuation and sealing
//! a finished task's continuation list race against each other; both sides
//! take the same lock, so no continuation is ever lost.

use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use super::thread_pool::ThreadPool;
use super::thread_pool::get_thread_id;
use crate::pool::GeometricGrowth;
use crate::pool::MemoryPool;
use crate::util::spin::SpinLock;

type TaskPoolGrowth = GeometricGrowth<64>;
type TaskBody = Box<dyn FnOnce() + Send + 'static>;

struct Task {
  body: Mutex<Option<TaskBody>>,
  deps: AtomicU32,
  refs: AtomicU32,
  completed: AtomicBool,
  aborted: AtomicBool,
  sealed: AtomicBool,
  continuations: SpinLock<Vec<TaskHandle>>,
  // Each task carries a handle to the per-thread pool it was allocated
  // from, so its last reference can return the storage without the
  // graph needing to track allocation sites itself.
  owner: MemoryPool<Task, TaskPoolGrowth>,
}

/// A reference-counted handle to a submitted task.
///
/// Cloning bumps an atomic refcount (mirroring `basic_task`'s `refs`);
/// dropping the last clone returns the task's storage to the per-thread
/// [`MemoryPool`] it was allocated from rather than freeing it.
pub struct TaskHandle {
  ptr: NonNull<Task>,
}

// SAFETY: `Task` is only ever accessed through shared references guarded
// by its own atomics/locks; no `TaskHandle` grants unsynchronized access
// to the pointee's fields.
unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

impl TaskHandle {
  fn task(&self) -> &Task {
    // SAFETY: a `TaskHandle` always holds a live refcount on `ptr`.
    unsafe { self.ptr.as_ref() }
  }

  /// Whether the task's body has returned normally (not via a panic).
  #[must_use]
  pub fn is_finished(&self) -> bool {
    self.task().completed.load(Ordering::Acquire)
  }

  /// Whether the task's body panicked. Continuations still run when a
  /// parent aborts.
  #[must_use]
  pub fn is_aborted(&self) -> bool {
    self.task().aborted.load(Ordering::Acquire)
  }

  fn is_settled(&self) -> bool {
    self.task().sealed.load(Ordering::Acquire)
  }
}

impl Clone for TaskHandle {
  fn clone(&self) -> Self {
    self.task().refs.fetch_add(1, Ordering::Relaxed);
    Self { ptr: self.ptr }
  }
}

impl Drop for TaskHandle {
  fn drop(&mut self) {
    if self.task().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
      // Last reference: clone the owning pool's handle out before
      // `destroy` drops `self.owner` in place along with the rest of
      // `Task`, then hand the slot back.
      let owner: MemoryPool<Task, TaskPoolGrowth> = self.task().owner.clone();
      unsafe {
        owner.destroy(self.ptr.as_ptr());
      }
    }
  }
}

/// A dependency-aware task scheduler layered over a [`ThreadPool`].
///
/// `submit` enqueues a task immediately; `submit_after` makes a task ready
/// only once every named parent has finished (successfully or via panic —
/// a parent's continuations always run either way).
pub struct TaskGraph {
  pool: Arc<ThreadPool>,
  // One pool per possible `get_thread_id()` value (0 = outside the pool,
  // 1..=N = pool workers), matching `task_system.hpp`'s per-thread
  // `stk::memory_pool<task>` keyed the same way.
  pools: Vec<MemoryPool<Task, TaskPoolGrowth>>,
}

impl TaskGraph {
  /// Builds a task graph atop `pool`.
  #[must_use]
  pub fn new(pool: Arc<ThreadPool>) -> Self {
    let slots: usize = pool.number_threads() + 1;
    let pools: Vec<MemoryPool<Task, TaskPoolGrowth>> = (0..slots).map(|_| MemoryPool::new(GeometricGrowth)).collect();
    Self { pool, pools }
  }

  /// Submits `f` with no dependencies; it becomes ready immediately.
  pub fn submit<F>(&self, f: F) -> TaskHandle
  where
    F: FnOnce() + Send + 'static,
  {
    self.submit_after(&[], f)
  }

  /// Submits `f`, ready only once every task in `parents` has finished
  /// (normally or via panic).
  pub fn submit_after<F>(&self, parents: &[&TaskHandle], f: F) -> TaskHandle
  where
    F: FnOnce() + Send + 'static,
  {
    let slot: usize = get_thread_id();
    let owner: MemoryPool<Task, TaskPoolGrowth> = self.pools[slot].clone();

    let task: Task = Task {
      body: Mutex::new(Some(Box::new(f))),
      deps: AtomicU32::new(parents.len() as u32),
      refs: AtomicU32::new(1),
      completed: AtomicBool::new(false),
      aborted: AtomicBool::new(false),
      sealed: AtomicBool::new(false),
      continuations: SpinLock::new(Vec::new()),
      owner: owner.clone(),
    };
    let raw: *mut Task = owner.construct(task);
    let handle: TaskHandle = TaskHandle {
      ptr: NonNull::new(raw).expect("pool allocation is never null"),
    };

    if parents.is_empty() {
      enqueue_ready(&self.pool, handle.clone());
      return handle;
    }

    for parent in parents {
      // Bump C's refcount before we know whether the parent is sealed:
      // either branch below consumes exactly this one increment, either
      // by storing it in the parent's continuation list or by releasing
      // it once the immediate dependency resolution finishes.
      let mut pending: Option<TaskHandle> = Some(handle.clone());
      {
        let mut continuations = parent.task().continuations.lock();
        if !parent.task().sealed.load(Ordering::Acquire) {
          continuations.push(pending.take().expect("set above"));
        }
      }
      if let Some(child_ref) = pending {
        resolve_dependency(&self.pool, child_ref);
      }
    }

    handle
  }

  /// Blocks the calling thread, stealing and running pool work, until
  /// `task`'s body has returned (successfully or via panic).
  pub fn wait(&self, task: &TaskHandle) {
    while !task.is_settled() {
      if !self.pool.try_run_one() {
        std::thread::yield_now();
      }
    }
  }
}

fn enqueue_ready(pool: &Arc<ThreadPool>, handle: TaskHandle) {
  let pool_for_job: Arc<ThreadPool> = Arc::clone(pool);
  pool.send_no_future(move || execute_task(&pool_for_job, handle));
}

fn execute_task(pool: &Arc<ThreadPool>, handle: TaskHandle) {
  let body: Option<TaskBody> = handle.task().body.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();

  if let Some(body) = body {
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
      Ok(()) => handle.task().completed.store(true, Ordering::Release),
      Err(_) => handle.task().aborted.store(true, Ordering::Release),
    }
  }

  let continuations: Vec<TaskHandle> = {
    let mut guard = handle.task().continuations.lock();
    handle.task().sealed.store(true, Ordering::Release);
    std::mem::take(&mut *guard)
  };

  for child in continuations {
    resolve_dependency(pool, child);
  }
}

fn resolve_dependency(pool: &Arc<ThreadPool>, child: TaskHandle) {
  let remaining: u32 = child.task().deps.fetch_sub(1, Ordering::AcqRel) - 1;
  if remaining == 0 {
    enqueue_ready(pool, child);
  }
  // Else: `child` drops here, releasing the refcount this attach attempt
  // held; the task still has other unfinished parents to hear from.
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32 as StdAtomicU32;

  #[test]
  fn submit_runs_the_task() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(2));
    let graph: TaskGraph = TaskGraph::new(pool);
    let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let ran_for_job: Arc<AtomicBool> = Arc::clone(&ran);
    let handle: TaskHandle = graph.submit(move || ran_for_job.store(true, Ordering::Release));
    graph.wait(&handle);
    assert!(ran.load(Ordering::Acquire));
    assert!(handle.is_finished());
  }

  #[test]
  fn child_observes_parent_side_effect() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(2));
    let graph: TaskGraph = TaskGraph::new(pool);
    let value: Arc<StdAtomicU32> = Arc::new(StdAtomicU32::new(0));

    let value_a: Arc<StdAtomicU32> = Arc::clone(&value);
    let a: TaskHandle = graph.submit(move || value_a.store(41, Ordering::Release));

    let value_b: Arc<StdAtomicU32> = Arc::clone(&value);
    let b: TaskHandle = graph.submit_after(&[&a], move || {
      let observed: u32 = value_b.load(Ordering::Acquire);
      value_b.store(observed + 1, Ordering::Release);
    });

    graph.wait(&b);
    assert_eq!(value.load(Ordering::Acquire), 42);
  }

  #[test]
  fn dependency_attached_after_parent_already_sealed_still_runs() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(2));
    let graph: TaskGraph = TaskGraph::new(pool);

    let a: TaskHandle = graph.submit(|| ());
    graph.wait(&a);

    let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let ran_for_job: Arc<AtomicBool> = Arc::clone(&ran);
    let b: TaskHandle = graph.submit_after(&[&a], move || ran_for_job.store(true, Ordering::Release));
    graph.wait(&b);
    assert!(ran.load(Ordering::Acquire));
  }

  #[test]
  fn exception_marks_aborted_not_finished_but_still_seals() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(2));
    let graph: TaskGraph = TaskGraph::new(pool);

    let c: TaskHandle = graph.submit(|| panic!("boom"));
    graph.wait(&c);

    assert!(c.is_aborted());
    assert!(!c.is_finished());
  }

  #[test]
  fn continuation_still_runs_after_parent_panics() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(2));
    let graph: TaskGraph = TaskGraph::new(pool);

    let a: TaskHandle = graph.submit(|| panic!("boom"));
    let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let ran_for_job: Arc<AtomicBool> = Arc::clone(&ran);
    let b: TaskHandle = graph.submit_after(&[&a], move || ran_for_job.store(true, Ordering::Release));

    graph.wait(&b);
    assert!(a.is_aborted());
    assert!(ran.load(Ordering::Acquire));
  }

  #[test]
  fn two_parents_gate_the_child() {
    let pool: Arc<ThreadPool> = Arc::new(ThreadPool::new(3));
    let graph: TaskGraph = TaskGraph::new(pool);

    let count: Arc<StdAtomicU32> = Arc::new(StdAtomicU32::new(0));
    let count_a: Arc<StdAtomicU32> = Arc::clone(&count);
    let count_b: Arc<StdAtomicU32> = Arc::clone(&count);
    let a: TaskHandle = graph.submit(move || {
      count_a.fetch_add(1, Ordering::AcqRel);
    });
    let b: TaskHandle = graph.submit(move || {
      count_b.fetch_add(1, Ordering::AcqRel);
    });

    let count_c: Arc<StdAtomicU32> = Arc::clone(&count);
    let c: TaskHandle = graph.submit_after(&[&a, &b], move || {
      assert_eq!(count_c.load(Ordering::Acquire), 2);
    });

    graph.wait(&c);
    assert!(c.is_finished());
  }
}
