//! Lock-free skip list map.
//!
//! Grounded in the marked-pointer lock-free skip list from Herlihy & Shavit,
//! "The Art of Multiprocessor Programming" (itself in the spirit of Harris's
//! lock-free linked list): every `next` pointer carries a mark bit via
//! [`AtomicMarkedPtr`], set top level down to bottom to logically delete a
//! node before any thread physically unlinks it. `find` helps unlink marked
//! nodes it encounters, so deletion completes even if the deleting thread
//! stalls after marking.

use std::cmp::Ordering as CmpOrdering;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::reclaim::rcnm::RefCountedNodeManager;
use crate::skiplist::level::MAX_LEVEL;
use crate::skiplist::level::coin_flip_level;
use crate::skiplist::ordered_map::OrderedMap;
use crate::tap::markable::AtomicMarkedPtr;

struct Node<K, V> {
  key: Option<K>,
  // A separately heap-allocated value, published through an atomic swap
  // rather than mutated in place through a shared `UnsafeCell`: a node
  // stays reachable (and its value pointer readable) for the lifetime of
  // any traversal that reached it, even after `insert` publishes a
  // replacement or `erase` takes the value out. Null only for the head
  // sentinel, which never carries a value.
  value: AtomicPtr<V>,
  top_level: usize,
  next: Box<[AtomicMarkedPtr<Node<K, V>>]>,
}

unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
  fn sentinel(top_level: usize) -> *mut Self {
    let next: Vec<AtomicMarkedPtr<Node<K, V>>> = (0..=top_level).map(|_| AtomicMarkedPtr::null()).collect();
    Box::into_raw(Box::new(Self {
      key: None,
      value: AtomicPtr::new(ptr::null_mut()),
      top_level,
      next: next.into_boxed_slice(),
    }))
  }

  fn new(key: K, value: V, top_level: usize) -> *mut Self {
    let next: Vec<AtomicMarkedPtr<Node<K, V>>> = (0..=top_level).map(|_| AtomicMarkedPtr::null()).collect();
    Box::into_raw(Box::new(Self {
      key: Some(key),
      value: AtomicPtr::new(Box::into_raw(Box::new(value))),
      top_level,
      next: next.into_boxed_slice(),
    }))
  }

  /// Frees the value this node currently points at, if any, without
  /// going through a reclaimer. Only sound once no other thread can
  /// still be reading the node (whole-structure drop/clear).
  unsafe fn drop_value_owned(&mut self) {
    let value: *mut V = *self.value.get_mut();
    if !value.is_null() {
      drop(unsafe { Box::from_raw(value) });
    }
  }
}

/// Frees the heap allocation backing a value pointer swapped out of a
/// node, without running `V`'s destructor a second time: the caller has
/// already moved the value out via [`ptr::read`]. Reinterpreting the
/// allocation as `Box<MaybeUninit<V>>` frees the same layout `Box<V>`
/// allocated without touching the (already-consumed) bytes.
///
/// # Safety
///
/// `value` must be a non-null pointer obtained from `Box::into_raw` on a
/// `Box<V>`, whose pointee has already been moved out via `ptr::read`.
unsafe fn dealloc_value<V>(value: *mut V) {
  drop(unsafe { Box::from_raw(value.cast::<MaybeUninit<V>>()) });
}

/// A skip list map where every traversal, insert, and delete proceeds
/// without ever blocking on another thread.
pub struct SkipListMap<K, V> {
  head: *mut Node<K, V>,
  len: AtomicUsize,
  manager: RefCountedNodeManager,
}

unsafe impl<K: Send, V: Send> Send for SkipListMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipListMap<K, V> {}

impl<K: Ord, V> SkipListMap<K, V> {
  /// Creates an empty skip list.
  #[must_use]
  pub fn new() -> Self {
    Self {
      head: Node::sentinel(MAX_LEVEL),
      len: AtomicUsize::new(0),
      manager: RefCountedNodeManager::new(),
    }
  }

  fn key_order(node: *mut Node<K, V>, key: &K) -> CmpOrdering {
    // SAFETY: every non-head node reachable in the list has `key = Some`.
    let node_key: &K = unsafe { (*node).key.as_ref().unwrap_unchecked() };
    node_key.cmp(key)
  }

  /// Atomically swaps `value` into `node`'s value slot, returning the
  /// value it displaced. Any reader that loaded the old pointer before
  /// this swap may go on dereferencing it; the allocation behind it is
  /// only freed once the node manager confirms no outstanding checkout
  /// could still observe it, so this is safe to call while `node` is
  /// concurrently visible to readers (unlike mutating a value in place
  /// through a shared cell).
  fn publish_value(&self, node: *mut Node<K, V>, value: *mut V) -> Option<V> {
    let old: *mut V = unsafe { (*node).value.swap(value, Ordering::AcqRel) };
    if old.is_null() {
      return None;
    }
    // SAFETY: `old` was exclusively displaced by the swap above, so no
    // future load of `node`'s value can observe it again; a reader that
    // already loaded it may still be mid-clone, so only the value's
    // bytes are read now, and the backing allocation is freed later,
    // deferred through the manager.
    let previous: V = unsafe { ptr::read(old) };
    let old_addr: usize = old as usize;
    self.manager.add(move || unsafe { dealloc_value(old_addr as *mut V) });
    Some(previous)
  }

  /// Searches for `key`, filling `preds`/`succs` at every level and
  /// helping unlink any marked (logically deleted) node it passes through.
  /// Returns whether a live, matching node sits at `succs[0]`.
  fn find(&self, key: &K, preds: &mut [*mut Node<K, V>], succs: &mut [*mut Node<K, V>]) -> bool {
    'retry: loop {
      let mut pred: *mut Node<K, V> = self.head;
      for level in (0..=MAX_LEVEL).rev() {
        let (mut curr, _): (*mut Node<K, V>, bool) = unsafe { (*pred).next[level].load(Ordering::Acquire) };
        loop {
          if curr.is_null() {
            break;
          }
          let (succ, marked): (*mut Node<K, V>, bool) = unsafe { (*curr).next[level].load(Ordering::Acquire) };
          if marked {
            match unsafe { (*pred).next[level].compare_exchange(curr, false, succ, false, Ordering::AcqRel) } {
              Ok(_) => {
                curr = succ;
                continue;
              }
              Err(_) => continue 'retry,
            }
          }
          if Self::key_order(curr, key) != CmpOrdering::Less {
            break;
          }
          pred = curr;
          curr = succ;
        }
        preds[level] = pred;
        succs[level] = curr;
      }
      return !succs[0].is_null() && Self::key_order(succs[0], key) == CmpOrdering::Equal;
    }
  }

  /// Inserts `value` for `key`, returning the previous value if `key` was
  /// already present.
  pub fn insert(&self, key: K, value: V) -> Option<V> {
    let top_level: usize = coin_flip_level(MAX_LEVEL);
    let mut preds: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut succs: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];

    if self.find(&key, &mut preds, &mut succs) {
      let found: *mut Node<K, V> = succs[0];
      let boxed: *mut V = Box::into_raw(Box::new(value));
      return self.publish_value(found, boxed);
    }

    let new_node: *mut Node<K, V> = Node::new(key, value, top_level);
    unsafe {
      (*new_node).next[0].store(succs[0], false, Ordering::Relaxed);
    }

    loop {
      let cas: Result<_, _> =
        unsafe { (*preds[0]).next[0].compare_exchange(succs[0], false, new_node, false, Ordering::AcqRel) };
      if cas.is_ok() {
        break;
      }
      let node_key: &K = unsafe { (*new_node).key.as_ref().unwrap_unchecked() };
      if self.find(node_key, &mut preds, &mut succs) {
        // someone inserted the same key first; fold our value into theirs
        let found: *mut Node<K, V> = succs[0];
        let boxed: *mut V = unsafe { (*new_node).value.swap(ptr::null_mut(), Ordering::AcqRel) };
        drop(unsafe { Box::from_raw(new_node) });
        return self.publish_value(found, boxed);
      }
      unsafe {
        (*new_node).next[0].store(succs[0], false, Ordering::Relaxed);
      }
    }

    self.len.fetch_add(1, Ordering::Relaxed);

    for level in 1..=top_level {
      loop {
        unsafe {
          (*new_node).next[level].store(succs[level], false, Ordering::Relaxed);
        }
        let cas: Result<_, _> =
          unsafe { (*preds[level]).next[level].compare_exchange(succs[level], false, new_node, false, Ordering::AcqRel) };
        if cas.is_ok() {
          break;
        }
        let node_key: &K = unsafe { (*new_node).key.as_ref().unwrap_unchecked() };
        self.find(node_key, &mut preds, &mut succs);
      }
    }

    None
  }

  /// Removes `key`'s entry, returning its value if present.
  ///
  /// Marks every level of the victim node from top to bottom before
  /// anyone physically unlinks it, then re-runs `find` to trigger that
  /// unlink via its helping path.
  pub fn erase(&self, key: &K) -> Option<V> {
    let mut preds: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut succs: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];

    if !self.find(key, &mut preds, &mut succs) {
      return None;
    }
    let victim: *mut Node<K, V> = succs[0];
    let top_level: usize = unsafe { (*victim).top_level };

    for level in (1..=top_level).rev() {
      loop {
        let (next, marked): (*mut Node<K, V>, bool) = unsafe { (*victim).next[level].load(Ordering::Acquire) };
        if marked {
          break;
        }
        if unsafe { (*victim).next[level].compare_exchange(next, false, next, true, Ordering::AcqRel) }.is_ok() {
          break;
        }
      }
    }

    loop {
      let (next, marked): (*mut Node<K, V>, bool) = unsafe { (*victim).next[0].load(Ordering::Acquire) };
      if marked {
        return None;
      }
      if unsafe { (*victim).next[0].compare_exchange(next, false, next, true, Ordering::AcqRel) }.is_ok() {
        break;
      }
    }

    self.len.fetch_sub(1, Ordering::Relaxed);
    // Atomically take the value pointer rather than mutating the cell in
    // place: a concurrent reader that already loaded this node may still
    // be mid-clone of the old value, so only the pointer hand-off happens
    // now, and the allocation is freed later alongside the node.
    let value_ptr: *mut V = unsafe { (*victim).value.swap(ptr::null_mut(), Ordering::AcqRel) };
    // SAFETY: `value_ptr` was just exclusively displaced from `victim`;
    // see `publish_value` for why reading it now (without freeing it
    // yet) is sound.
    let removed: Option<V> = if value_ptr.is_null() {
      None
    } else {
      Some(unsafe { ptr::read(value_ptr) })
    };

    let _ = self.find(key, &mut preds, &mut succs);

    let retire_target: usize = victim as usize;
    let retire_value: usize = value_ptr as usize;
    self.manager.add(move || {
      // SAFETY: unlinked via `find`'s helping path above; no live
      // traversal can still reach this pointer after this point's
      // checkout epoch drains. `retire_value`'s pointee (if any) was
      // already moved out above, so only its backing allocation is
      // freed here.
      if retire_value != 0 {
        unsafe { dealloc_value(retire_value as *mut V) };
      }
      drop(unsafe { Box::from_raw(retire_target as *mut Node<K, V>) });
    });

    removed
  }
}

impl<K: Ord, V> OrderedMap<K, V> for SkipListMap<K, V> {
  fn find(&self, key: &K) -> Option<V>
  where
    V: Clone,
  {
    let checkout = self.manager.checkout();
    let mut preds: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut succs: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let found: bool = SkipListMap::find(self, key, &mut preds, &mut succs);
    let result: Option<V> = if found {
      // SAFETY: `checkout` is held until after this read, so even if a
      // concurrent `insert`/`erase` displaces this value, the manager
      // defers freeing it until the checkout is released.
      let value_ptr: *mut V = unsafe { (*succs[0]).value.load(Ordering::Acquire) };
      if value_ptr.is_null() { None } else { Some(unsafe { (*value_ptr).clone() }) }
    } else {
      None
    };
    drop(checkout);
    result
  }

  fn insert(&self, key: K, value: V) -> Option<V> {
    SkipListMap::insert(self, key, value)
  }

  fn erase(&self, key: &K) -> Option<V> {
    SkipListMap::erase(self, key)
  }

  fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  fn clear(&self) {
    let mut node: *mut Node<K, V> = unsafe { (*self.head).next[0].load(Ordering::Acquire).0 };
    for level in 0..=MAX_LEVEL {
      unsafe {
        (*self.head).next[level].store(ptr::null_mut(), false, Ordering::Relaxed);
      }
    }
    self.len.store(0, Ordering::Relaxed);
    while !node.is_null() {
      let next: *mut Node<K, V> = unsafe { (*node).next[0].load(Ordering::Relaxed).0 };
      // SAFETY: not thread-safe, per this method's contract; no
      // concurrent traversal can be observing these nodes.
      unsafe { (*node).drop_value_owned() };
      drop(unsafe { Box::from_raw(node) });
      node = next;
    }
  }

  fn range(&self, start: &K, end: &K) -> Vec<(K, V)>
  where
    K: Clone,
    V: Clone,
  {
    self.iter().into_iter().filter(|(k, _)| k >= start && k < end).collect()
  }

  fn iter(&self) -> Vec<(K, V)>
  where
    K: Clone,
    V: Clone,
  {
    let _checkout = self.manager.checkout();
    let mut out: Vec<(K, V)> = Vec::new();
    let mut node: *mut Node<K, V> = unsafe { (*self.head).next[0].load(Ordering::Acquire).0 };
    while !node.is_null() {
      unsafe {
        let (next, marked): (*mut Node<K, V>, bool) = (*node).next[0].load(Ordering::Acquire);
        if !marked {
          let value_ptr: *mut V = (*node).value.load(Ordering::Acquire);
          if !value_ptr.is_null() {
            let key: K = (*node).key.as_ref().unwrap_unchecked().clone();
            let value: V = (*value_ptr).clone();
            out.push((key, value));
          }
        }
        node = next;
      }
    }
    out
  }
}

impl<K: Ord, V> Default for SkipListMap<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> Drop for SkipListMap<K, V> {
  fn drop(&mut self) {
    let mut node: *mut Node<K, V> = self.head;
    while !node.is_null() {
      let next: *mut Node<K, V> = unsafe { (*node).next[0].load(Ordering::Relaxed).0 };
      unsafe { (*node).drop_value_owned() };
      drop(unsafe { Box::from_raw(node) });
      node = next;
    }
  }
}
