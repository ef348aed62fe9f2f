//! A lock-free, geometrically-growing concurrent vector.
//!
//! Grounded in `concurrent_vector` from `concurrent_vector.hpp`: a shared
//! [`Descriptor`] published via CAS captures each in-flight `push_back`,
//! and every mutator first "helps" complete whatever descriptor it finds
//! outstanding before building its own. `complete_write` always attempts
//! its help-CAS regardless of outcome — the original's stray semicolon
//! made that look conditional, but the CAS itself runs unconditionally
//! either way.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

use crate::reclaim::rcnm::RefCountedNodeManager;
use crate::tap::AtomicStampedPtr;
use crate::vector::descriptor::Descriptor;
use crate::vector::descriptor::WriteState;
use crate::vector::layout::bucket_for;
use crate::vector::layout::bucket_len;

struct Node<T> {
  value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Sync> Sync for Node<T> {}

impl<T> Node<T> {
  fn new(value: T) -> *mut Self {
    Box::into_raw(Box::new(Self {
      value: UnsafeCell::new(Some(value)),
    }))
  }
}

type BucketPtr<T> = *mut AtomicPtr<Node<T>>;
type BucketArray<T> = *mut BucketPtr<T>;

/// A dynamically-growable array supporting concurrent `push_back` and
/// `pop_back` without locking.
pub struct ConcurrentVec<T> {
  descriptor: AtomicPtr<Descriptor<Node<T>>>,
  buckets: AtomicStampedPtr<BucketPtr<T>>,
  manager: RefCountedNodeManager,
}

unsafe impl<T: Send> Send for ConcurrentVec<T> {}
unsafe impl<T: Send> Sync for ConcurrentVec<T> {}

impl<T> ConcurrentVec<T> {
  /// Creates an empty vector with its first bucket already allocated.
  #[must_use]
  pub fn new() -> Self {
    let first_len: usize = bucket_len(0);
    let first_bucket: Vec<AtomicPtr<Node<T>>> = (0..first_len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
    let first_bucket_ptr: BucketPtr<T> = Box::into_raw(first_bucket.into_boxed_slice()) as *mut AtomicPtr<Node<T>>;
    let array: BucketArray<T> = Box::into_raw(vec![first_bucket_ptr].into_boxed_slice()) as *mut BucketPtr<T>;

    Self {
      descriptor: AtomicPtr::new(Box::into_raw(Box::new(Descriptor::read(0)))),
      buckets: AtomicStampedPtr::new(array, 1),
      manager: RefCountedNodeManager::new(),
    }
  }

  fn slot(&self, index: usize) -> &AtomicPtr<Node<T>> {
    let (bucket, offset) = bucket_for(index);
    let (array, _count): (BucketArray<T>, u16) = self.buckets.load(Ordering::Acquire);
    unsafe {
      let bucket_ptr: BucketPtr<T> = *array.add(bucket);
      &*bucket_ptr.add(offset)
    }
  }

  fn ensure_bucket(&self, bucket: usize) {
    loop {
      let (array, count): (BucketArray<T>, u16) = self.buckets.load(Ordering::Acquire);
      if (bucket as u16) < count {
        return;
      }
      self.allocate_bucket(array, count);
    }
  }

  fn allocate_bucket(&self, old_array: BucketArray<T>, old_count: u16) {
    let new_index: usize = old_count as usize;
    let new_len: usize = bucket_len(new_index);
    let new_bucket: Vec<AtomicPtr<Node<T>>> = (0..new_len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
    let new_bucket_ptr: BucketPtr<T> = Box::into_raw(new_bucket.into_boxed_slice()) as *mut AtomicPtr<Node<T>>;

    let mut new_array_vec: Vec<BucketPtr<T>> = Vec::with_capacity(new_index + 1);
    for b in 0..new_index {
      new_array_vec.push(unsafe { *old_array.add(b) });
    }
    new_array_vec.push(new_bucket_ptr);
    let new_array: BucketArray<T> = Box::into_raw(new_array_vec.into_boxed_slice()) as *mut BucketPtr<T>;

    match self
      .buckets
      .compare_exchange(old_array, old_count, new_array, old_count + 1, Ordering::AcqRel)
    {
      Ok(_) => {
        // The old index array is a strict prefix of the new one; only the
        // outer pointer array is retired, not the bucket storage it
        // points into.
        let retire_target: usize = old_array as usize;
        self.manager.add(move || {
          drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(retire_target as *mut BucketPtr<T>, old_count as usize)) });
        });
      }
      Err(_) => {
        drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(new_array, new_index + 1)) });
        drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(new_bucket_ptr, new_len)) });
      }
    }
  }

  fn complete_write(&self, desc: *mut Descriptor<Node<T>>) {
    unsafe {
      if (*desc).state() == WriteState::WritePending {
        let slot: &AtomicPtr<Node<T>> = self.slot((*desc).location);
        let _ = slot.compare_exchange((*desc).old_value, (*desc).new_value, Ordering::AcqRel, Ordering::Acquire);
        (*desc).mark_complete();
      }
    }
  }

  /// Appends `value`, publishing a new descriptor via CAS.
  pub fn push_back(&self, value: T) {
    let new_node: *mut Node<T> = Node::new(value);
    loop {
      let checkout = self.manager.checkout();
      let curr: *mut Descriptor<Node<T>> = self.descriptor.load(Ordering::Acquire);
      self.complete_write(curr);
      let curr_size: usize = unsafe { (*curr).size };
      let (bucket, _offset) = bucket_for(curr_size);
      self.ensure_bucket(bucket);
      let old_value: *mut Node<T> = self.slot(curr_size).load(Ordering::Acquire);
      let new_desc: *mut Descriptor<Node<T>> =
        Box::into_raw(Box::new(Descriptor::write_pending(curr_size + 1, old_value, new_node, curr_size)));

      match self.descriptor.compare_exchange(curr, new_desc, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
          self.complete_write(new_desc);
          let retire_target: usize = curr as usize;
          self.manager.add(move || {
            drop(unsafe { Box::from_raw(retire_target as *mut Descriptor<Node<T>>) });
          });
          drop(checkout);
          return;
        }
        Err(_) => {
          drop(unsafe { Box::from_raw(new_desc) });
          drop(checkout);
        }
      }
    }
  }

  /// Removes and returns the last element, or `None` if the vector is
  /// empty at the moment of the winning CAS.
  pub fn pop_back(&self) -> Option<T> {
    let checkout = self.manager.checkout();
    loop {
      let curr: *mut Descriptor<Node<T>> = self.descriptor.load(Ordering::Acquire);
      self.complete_write(curr);
      let curr_size: usize = unsafe { (*curr).size };
      if curr_size == 0 {
        drop(checkout);
        return None;
      }
      let popped_node: *mut Node<T> = self.slot(curr_size - 1).load(Ordering::Acquire);
      let new_desc: *mut Descriptor<Node<T>> = Box::into_raw(Box::new(Descriptor::read(curr_size - 1)));

      match self.descriptor.compare_exchange(curr, new_desc, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
          let value: T = unsafe { (*(*popped_node).value.get()).take().unwrap_unchecked() };
          let retire_desc: usize = curr as usize;
          self.manager.add(move || {
            drop(unsafe { Box::from_raw(retire_desc as *mut Descriptor<Node<T>>) });
          });
          let retire_node: usize = popped_node as usize;
          self.manager.add(move || {
            drop(unsafe { Box::from_raw(retire_node as *mut Node<T>) });
          });
          drop(checkout);
          return Some(value);
        }
        Err(_) => {
          drop(unsafe { Box::from_raw(new_desc) });
        }
      }
    }
  }

  /// Ensures at least `capacity` elements' worth of buckets are allocated.
  /// Single-threaded-friendly: concurrent callers will contend on the same
  /// CAS but never corrupt state.
  pub fn reserve(&self, capacity: usize) {
    if capacity == 0 {
      return;
    }
    let (bucket, _offset) = bucket_for(capacity - 1);
    self.ensure_bucket(bucket);
  }

  /// The number of live elements, excluding one still `WritePending`.
  pub fn len(&self) -> usize {
    let checkout = self.manager.checkout();
    let curr: *mut Descriptor<Node<T>> = self.descriptor.load(Ordering::Acquire);
    let mut size: usize = unsafe { (*curr).size };
    if unsafe { (*curr).state() } == WriteState::WritePending {
      size -= 1;
    }
    drop(checkout);
    size
  }

  /// Whether the vector currently holds no elements.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns a clone of the element at `index`, or `None` if out of range.
  pub fn get(&self, index: usize) -> Option<T>
  where
    T: Clone,
  {
    if index >= self.len() {
      return None;
    }
    let checkout = self.manager.checkout();
    let node: *mut Node<T> = self.slot(index).load(Ordering::Acquire);
    let result: Option<T> = if node.is_null() {
      None
    } else {
      unsafe { (*(*node).value.get()).clone() }
    };
    drop(checkout);
    result
  }

  /// Invokes `f` with a borrow of the element at `index`, under a node
  /// manager checkout, returning `None` if out of range. Mirrors the
  /// original's "reference valid only while not reclaimed" contract
  /// without exposing a borrow past this call.
  pub fn with<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
    if index >= self.len() {
      return None;
    }
    let checkout = self.manager.checkout();
    let node: *mut Node<T> = self.slot(index).load(Ordering::Acquire);
    let result: Option<R> = if node.is_null() {
      None
    } else {
      unsafe { (*(*node).value.get()).as_ref().map(f) }
    };
    drop(checkout);
    result
  }

  /// Removes every element by repeated `pop_back`.
  pub fn clear(&self) {
    while self.pop_back().is_some() {}
  }
}

impl<T> Default for ConcurrentVec<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for ConcurrentVec<T> {
  fn drop(&mut self) {
    let curr: *mut Descriptor<Node<T>> = self.descriptor.load(Ordering::Relaxed);
    let size: usize = unsafe { (*curr).size };
    for i in 0..size {
      let node: *mut Node<T> = self.slot(i).load(Ordering::Relaxed);
      if !node.is_null() {
        drop(unsafe { Box::from_raw(node) });
      }
    }
    drop(unsafe { Box::from_raw(curr) });

    let (array, count): (BucketArray<T>, u16) = self.buckets.load(Ordering::Relaxed);
    for b in 0..count as usize {
      let bucket_ptr: BucketPtr<T> = unsafe { *array.add(b) };
      drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(bucket_ptr, bucket_len(b))) });
    }
    drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(array, count as usize)) });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::Mutex;
  use std::thread;

  #[test]
  fn push_and_pop_round_trip() {
    let vec: ConcurrentVec<i32> = ConcurrentVec::new();
    assert!(vec.is_empty());
    vec.push_back(1);
    vec.push_back(2);
    vec.push_back(3);
    assert_eq!(vec.len(), 3);
    assert_eq!(vec.get(0), Some(1));
    assert_eq!(vec.get(2), Some(3));
    assert_eq!(vec.pop_back(), Some(3));
    assert_eq!(vec.pop_back(), Some(2));
    assert_eq!(vec.len(), 1);
  }

  #[test]
  fn pop_back_of_empty_is_none() {
    let vec: ConcurrentVec<i32> = ConcurrentVec::new();
    assert_eq!(vec.pop_back(), None);
  }

  #[test]
  fn grows_across_several_buckets() {
    let vec: ConcurrentVec<u32> = ConcurrentVec::new();
    for i in 0..200u32 {
      vec.push_back(i);
    }
    assert_eq!(vec.len(), 200);
    for i in 0..200u32 {
      assert_eq!(vec.get(i as usize), Some(i));
    }
  }

  #[test]
  fn with_borrows_without_cloning() {
    let vec: ConcurrentVec<String> = ConcurrentVec::new();
    vec.push_back("hello".to_string());
    let len: Option<usize> = vec.with(0, |s| s.len());
    assert_eq!(len, Some(5));
    assert_eq!(vec.with(5, |s: &String| s.len()), None);
  }

  #[test]
  fn clear_empties_the_vector() {
    let vec: ConcurrentVec<i32> = ConcurrentVec::new();
    for i in 0..10 {
      vec.push_back(i);
    }
    vec.clear();
    assert!(vec.is_empty());
  }

  #[test]
  fn concurrent_push_back_places_every_value_exactly_once() {
    let vec: Arc<ConcurrentVec<u32>> = Arc::new(ConcurrentVec::new());
    const PER_THREAD: u32 = 200;

    thread::scope(|scope| {
      for t in 0..4u32 {
        let vec: Arc<ConcurrentVec<u32>> = Arc::clone(&vec);
        scope.spawn(move || {
          for i in 0..PER_THREAD {
            vec.push_back(t * PER_THREAD + i);
          }
        });
      }
    });

    assert_eq!(vec.len(), (4 * PER_THREAD) as usize);
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..vec.len() {
      seen.lock().unwrap().push(vec.get(i).unwrap());
    }
    let mut values: Vec<u32> = seen.lock().unwrap().clone();
    values.sort_unstable();
    let expected: Vec<u32> = (0..4 * PER_THREAD).collect();
    assert_eq!(values, expected);
  }
}
