//! A thread-safe pool that constructs `T` on every [`allocate`](MemoryPool::allocate)
//! and destroys it on every [`deallocate`](MemoryPool::deallocate).
//!
//! Grounded in `memory_pool.hpp`'s `memory_pool<T, GrowthPolicy>`: blocks
//! grow under a [`GrowthPolicy`](super::GrowthPolicy), are appended, and are
//! never shrunk; a lock-free free list (here, [`PoolBase`]'s Treiber stack)
//! hands out slots in O(1) amortized.

use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ops::DerefMut;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use super::base::PoolBase;
use super::growth::GeometricGrowth;
use super::growth::GrowthPolicy;

/// A thread-safe, block-growing allocator that constructs each `T` at
/// [`allocate`](Self::allocate) time and destroys it at
/// [`deallocate`](Self::deallocate) time.
///
/// Every pooled slot carries an O(1)-recoverable back-pointer to the pool
/// it was drawn from: see [`pool_of`].
pub struct MemoryPool<T, G = GeometricGrowth<100>> {
  base: Arc<PoolBase<T, G>>,
}

impl<T, G> Clone for MemoryPool<T, G> {
  /// Clones the handle, not the pool: the returned `MemoryPool` shares the
  /// same blocks and free list as `self`, matching `memory_pool`'s own
  /// reference-semantics in the original (`stk::memory_pool<T>` instances
  /// are always handed around behind a `shared_ptr`).
  fn clone(&self) -> Self {
    Self {
      base: Arc::clone(&self.base),
    }
  }
}

impl<T, G: GrowthPolicy> MemoryPool<T, G> {
  /// Creates an empty pool using the given growth policy. The first block
  /// is allocated lazily, on the first `allocate`.
  #[must_use]
  pub fn new(growth: G) -> Self {
    Self {
      base: Arc::new(PoolBase::new(growth)),
    }
  }

  /// Reserves raw storage for a `T`, expanding the pool if the free list is
  /// empty. The returned slot is uninitialized; pair with
  /// [`construct`](Self::construct) or use [`make`](Self::make)/[`make_pooled`](Self::make_pooled).
  pub fn allocate(&self) -> *mut T {
    loop {
      if let Some(node) = self.base.pop_free() {
        let slot: *mut T = node.cast();
        // SAFETY: `node` came from this pool's free list.
        unsafe {
          PoolBase::<T, G>::set_owner(slot, Arc::as_ptr(&self.base).cast());
        }
        return slot;
      }
      self.base.expand(|_| {});
    }
  }

  /// Constructs `value` into storage drawn from [`allocate`](Self::allocate)
  /// and returns the initialized pointer.
  pub fn construct(&self, value: T) -> *mut T {
    let slot: *mut T = self.allocate();
    unsafe {
      slot.write(value);
    }
    slot
  }

  /// Runs `T`'s destructor and returns the slot to the pool's free list.
  ///
  /// # Safety
  ///
  /// `ptr` must have come from this pool's [`construct`]/[`allocate`] and
  /// must not be used again afterwards.
  pub unsafe fn destroy(&self, ptr: *mut T) {
    unsafe {
      ptr::drop_in_place(ptr);
    }
    self.deallocate(ptr);
  }

  /// Returns a previously-allocated, already-destroyed slot to the free
  /// list without running `T`'s destructor. Prefer [`destroy`](Self::destroy)
  /// unless the caller has already taken care of that.
  ///
  /// # Safety
  ///
  /// `ptr` must have come from this pool and must not be read or written
  /// again until a subsequent `allocate` hands it back out.
  pub unsafe fn deallocate(&self, ptr: *mut T) {
    unsafe {
      PoolBase::<T, G>::clear_owner(ptr);
    }
    let node = ptr.cast();
    self.base.push_free(node);
  }

  /// Builds a value with `construct` and wraps it in a [`PooledPtr`] that
  /// calls [`destroy`](Self::destroy) on drop, mirroring
  /// `make_unique_from_pool`/`pooled_ptr`.
  pub fn make_pooled(&self, value: T) -> PooledPtr<T, G> {
    let ptr: *mut T = self.construct(value);
    PooledPtr {
      ptr: NonNull::new(ptr).expect("pool allocation is never null"),
      pool: Arc::clone(&self.base),
    }
  }

  /// The number of elements the pool currently holds across all blocks
  /// (monotone increasing, never shrinks).
  #[must_use]
  pub fn size_elements(&self) -> usize {
    self.base.blocks_allocated_elements()
  }

  /// An approximate count of free (unallocated) slots; only exact absent
  /// concurrent activity.
  #[must_use]
  pub fn size_free(&self) -> usize {
    self.base.approx_free_count()
  }
}

/// Recovers the [`MemoryPool`] that `ptr` was allocated from in O(1), per
/// `memory_pool_base::get_pool`.
///
/// # Safety
///
/// `ptr` must currently be checked out (allocated and not yet deallocated)
/// from some live `MemoryPool<T, G>`.
pub unsafe fn pool_of<T, G: GrowthPolicy>(ptr: *const T) -> *const PoolBase<T, G> {
  unsafe { PoolBase::<T, G>::owner_of(ptr).cast() }
}

/// A smart pointer to a value drawn from a [`MemoryPool`] that runs the
/// value's destructor and returns its slot to the pool when dropped,
/// mirroring `pool_deleter`/`pooled_ptr` in `memory_pool.hpp`.
pub struct PooledPtr<T, G> {
  ptr: NonNull<T>,
  pool: Arc<PoolBase<T, G>>,
}

unsafe impl<T: Send, G: Send + Sync> Send for PooledPtr<T, G> {}
unsafe impl<T: Sync, G: Send + Sync> Sync for PooledPtr<T, G> {}

impl<T, G: GrowthPolicy> Deref for PooledPtr<T, G> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: `ptr` is exclusively owned by this handle until drop.
    unsafe { self.ptr.as_ref() }
  }
}

impl<T, G: GrowthPolicy> DerefMut for PooledPtr<T, G> {
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: `ptr` is exclusively owned by this handle until drop.
    unsafe { self.ptr.as_mut() }
  }
}

impl<T, G: GrowthPolicy> Drop for PooledPtr<T, G> {
  fn drop(&mut self) {
    let ptr: *mut T = self.ptr.as_ptr();
    unsafe {
      ptr::drop_in_place(ptr);
      PoolBase::<T, G>::clear_owner(ptr);
    }
    self.pool.push_free(ptr.cast());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pool::growth::ConstantGrowth;

  #[test]
  fn construct_and_destroy_round_trips() {
    let pool: MemoryPool<u64, ConstantGrowth<4>> = MemoryPool::new(ConstantGrowth);
    let a: *mut u64 = pool.construct(7);
    let b: *mut u64 = pool.construct(9);
    unsafe {
      assert_eq!(*a, 7);
      assert_eq!(*b, 9);
      pool.destroy(a);
      pool.destroy(b);
    }
  }

  #[test]
  fn pool_of_recovers_owning_pool() {
    let pool: MemoryPool<u64, ConstantGrowth<4>> = MemoryPool::new(ConstantGrowth);
    let ptr: *mut u64 = pool.construct(1);
    let recovered: *const PoolBase<u64, ConstantGrowth<4>> = unsafe { pool_of(ptr) };
    assert_eq!(recovered, Arc::as_ptr(&pool.base));
    unsafe { pool.destroy(ptr) };
  }

  #[test]
  fn expands_past_initial_block() {
    let pool: MemoryPool<u64, ConstantGrowth<2>> = MemoryPool::new(ConstantGrowth);
    let ptrs: Vec<*mut u64> = (0..10).map(|i| pool.construct(i)).collect();
    assert!(pool.size_elements() >= 10);
    for (i, ptr) in ptrs.iter().enumerate() {
      unsafe {
        assert_eq!(**ptr, i as u64);
        pool.destroy(*ptr);
      }
    }
  }

  #[test]
  fn pooled_ptr_runs_destructor_on_drop() {
    use std::sync::Arc as StdArc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct DropCounter(StdArc<AtomicUsize>);
    impl Drop for DropCounter {
      fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
      }
    }

    let counter: StdArc<AtomicUsize> = StdArc::new(AtomicUsize::new(0));
    let pool: MemoryPool<DropCounter, ConstantGrowth<4>> = MemoryPool::new(ConstantGrowth);
    {
      let _pooled = pool.make_pooled(DropCounter(StdArc::clone(&counter)));
      assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }
}
