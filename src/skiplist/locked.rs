//! Fine-grained lock-based skip list map.
//!
//! Grounded in the lock-based lazy skip list from Herlihy & Shavit, "The
//! Art of Multiprocessor Programming" — the same algorithm
//! `stk::detail::associative_map_traits`'s `mutex_type = tiny_atomic_spin_lock<>`
//! parameterization is built for. Per-node locking uses
//! [`crate::util::spin::SpinLock`] in place of `tiny_atomic_spin_lock`
//! (no Rust port of that type exists in the reference pack). Deleted
//! nodes are handed to a [`RefCountedNodeManager`] rather than freed
//! immediately, since lookups traverse the list lock-free.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::reclaim::rcnm::RefCountedNodeManager;
use crate::skiplist::level::MAX_LEVEL;
use crate::skiplist::level::coin_flip_level;
use crate::skiplist::ordered_map::OrderedMap;
use crate::util::spin::SpinLock;

struct Node<K, V> {
  key: Option<K>,
  value: std::cell::UnsafeCell<Option<V>>,
  top_level: usize,
  next: Box<[AtomicPtr<Node<K, V>>]>,
  marked: AtomicBool,
  fully_linked: AtomicBool,
  lock: SpinLock<()>,
}

unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
  fn sentinel(top_level: usize) -> *mut Self {
    let next: Vec<AtomicPtr<Node<K, V>>> = (0..=top_level).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
    Box::into_raw(Box::new(Self {
      key: None,
      value: std::cell::UnsafeCell::new(None),
      top_level,
      next: next.into_boxed_slice(),
      marked: AtomicBool::new(false),
      fully_linked: AtomicBool::new(true),
      lock: SpinLock::new(()),
    }))
  }

  fn new(key: K, value: V, top_level: usize) -> *mut Self {
    let next: Vec<AtomicPtr<Node<K, V>>> = (0..=top_level).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
    Box::into_raw(Box::new(Self {
      key: Some(key),
      value: std::cell::UnsafeCell::new(Some(value)),
      top_level,
      next: next.into_boxed_slice(),
      marked: AtomicBool::new(false),
      fully_linked: AtomicBool::new(false),
      lock: SpinLock::new(()),
    }))
  }
}

/// A skip list map guarded by a per-node spin lock, following the
/// "optimistic lazy" insert/delete protocol: lookups never lock, inserts
/// and deletes lock only the predecessor nodes they touch.
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

  /// Searches for `key`, filling `preds`/`succs` with, at every level,
  /// the last node strictly less than `key` and the first node greater
  /// than or equal to it. Returns the level at which a live, matching
  /// node was found, or `None`.
  fn find(&self, key: &K, preds: &mut [*mut Node<K, V>], succs: &mut [*mut Node<K, V>]) -> Option<usize> {
    let mut level_found: Option<usize> = None;
    let mut pred: *mut Node<K, V> = self.head;
    for level in (0..=MAX_LEVEL).rev() {
      let mut curr: *mut Node<K, V> = unsafe { (*pred).next[level].load(Ordering::Acquire) };
      while !curr.is_null() && Self::key_order(curr, key) == CmpOrdering::Less {
        pred = curr;
        curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
      }
      if level_found.is_none() && !curr.is_null() && Self::key_order(curr, key) == CmpOrdering::Equal {
        level_found = Some(level);
      }
      preds[level] = pred;
      succs[level] = curr;
    }
    level_found
  }

  /// Inserts `value` for `key`, returning the previous value if `key` was
  /// already present.
  pub fn insert(&self, key: K, value: V) -> Option<V> {
    let top_level: usize = coin_flip_level(MAX_LEVEL);
    let mut preds: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut succs: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];

    loop {
      if let Some(level_found) = self.find(&key, &mut preds, &mut succs) {
        let found: *mut Node<K, V> = succs[level_found];
        if unsafe { !(*found).marked.load(Ordering::Acquire) } {
          while unsafe { !(*found).fully_linked.load(Ordering::Acquire) } {
            std::hint::spin_loop();
          }
          // The node's own lock serializes this replace against both a
          // concurrent `erase` (which takes the value under the same
          // lock while marking) and any reader that locks the node to
          // clone its value, so neither side ever observes a torn read.
          let guard = unsafe { (*found).lock.lock() };
          if unsafe { (*found).marked.load(Ordering::Acquire) } {
            drop(guard);
            continue; // lost the race with a delete of the same key; retry
          }
          let slot: &mut Option<V> = unsafe { &mut *(*found).value.get() };
          let previous: Option<V> = std::mem::replace(slot, Some(value));
          drop(guard);
          return previous;
        }
        continue; // racing with a delete of the same key; retry
      }

      let mut guards: Vec<crate::util::spin::SpinGuard<'_, ()>> = Vec::with_capacity(top_level + 1);
      let mut valid: bool = true;
      for level in 0..=top_level {
        let pred: *mut Node<K, V> = preds[level];
        let succ: *mut Node<K, V> = succs[level];
        guards.push(unsafe { (*pred).lock.lock() });
        let pred_unmarked: bool = unsafe { !(*pred).marked.load(Ordering::Acquire) };
        let pred_points_to_succ: bool = unsafe { (*pred).next[level].load(Ordering::Acquire) } == succ;
        if !pred_unmarked || !pred_points_to_succ {
          valid = false;
          break;
        }
      }

      if !valid {
        drop(guards);
        continue;
      }

      let new_node: *mut Node<K, V> = Node::new(key, value, top_level);
      for level in 0..=top_level {
        unsafe {
          (*new_node).next[level].store(succs[level], Ordering::Relaxed);
          (*preds[level]).next[level].store(new_node, Ordering::Release);
        }
      }
      unsafe {
        (*new_node).fully_linked.store(true, Ordering::Release);
      }
      self.len.fetch_add(1, Ordering::Relaxed);
      return None;
    }
  }

  /// Removes `key`'s entry, returning its value if present.
  ///
  /// Follows Herlihy & Shavit's lazy delete: mark the victim logically
  /// deleted first (so concurrent `insert`/`erase` calls for the same key
  /// back off), then lock and validate every predecessor before physically
  /// unlinking.
  pub fn erase(&self, key: &K) -> Option<V> {
    let mut preds: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut succs: Vec<*mut Node<K, V>> = vec![ptr::null_mut(); MAX_LEVEL + 1];
    let mut victim: *mut Node<K, V> = ptr::null_mut();
    let mut is_marked: bool = false;
    let mut top_level: usize = 0;
    let mut removed_value: Option<V> = None;

    loop {
      let level_found: Option<usize> = self.find(key, &mut preds, &mut succs);

      if !is_marked {
        let Some(level_found) = level_found else {
          return None;
        };
        let candidate: *mut Node<K, V> = succs[level_found];
        let candidate_fully_linked: bool = unsafe { (*candidate).fully_linked.load(Ordering::Acquire) };
        let candidate_top_level: usize = unsafe { (*candidate).top_level };
        if !(candidate_fully_linked && candidate_top_level == level_found) {
          continue;
        }

        let guard = unsafe { (*candidate).lock.lock() };
        if unsafe { (*candidate).marked.load(Ordering::Acquire) } {
          drop(guard);
          return None;
        }
        unsafe { (*candidate).marked.store(true, Ordering::Release) };
        // Take the value out while still holding the node's lock: any
        // reader's clone of this value takes the same lock (see
        // `OrderedMap::find`/`iter`), so this critical section is
        // mutually exclusive with every such read, and no reader
        // reaches this node afterwards since they all check `marked`
        // before cloning under that same lock.
        removed_value = unsafe { (*candidate).value.get().as_mut().unwrap_unchecked().take() };
        drop(guard);

        victim = candidate;
        top_level = candidate_top_level;
        is_marked = true;
      }

      let mut guards: Vec<crate::util::spin::SpinGuard<'_, ()>> = Vec::with_capacity(top_level + 1);
      let mut valid: bool = true;
      for level in 0..=top_level {
        let pred: *mut Node<K, V> = preds[level];
        guards.push(unsafe { (*pred).lock.lock() });
        let pred_unmarked: bool = unsafe { !(*pred).marked.load(Ordering::Acquire) };
        let pred_points_to_victim: bool = unsafe { (*pred).next[level].load(Ordering::Acquire) } == victim;
        if !pred_unmarked || !pred_points_to_victim {
          valid = false;
          break;
        }
      }

      if !valid {
        drop(guards);
        continue;
      }

      for level in (0..=top_level).rev() {
        unsafe {
          let next: *mut Node<K, V> = (*victim).next[level].load(Ordering::Acquire);
          (*preds[level]).next[level].store(next, Ordering::Release);
        }
      }
      drop(guards);

      self.len.fetch_sub(1, Ordering::Relaxed);
      let retire_target: usize = victim as usize;
      self.manager.add(move || {
        // SAFETY: unlinked above; no live traversal can still reach this
        // pointer after this point's checkout epoch drains.
        drop(unsafe { Box::from_raw(retire_target as *mut Node<K, V>) });
      });
      return removed_value;
    }
  }
}

impl<K: Ord, V> OrderedMap<K, V> for SkipListMap<K, V> {
  fn find(&self, key: &K) -> Option<V>
  where
    V: Clone,
  {
    let checkout = self.manager.checkout();
    let mut pred: *mut Node<K, V> = self.head;
    for level in (0..=MAX_LEVEL).rev() {
      let mut curr: *mut Node<K, V> = unsafe { (*pred).next[level].load(Ordering::Acquire) };
      while !curr.is_null() && Self::key_order(curr, key) == CmpOrdering::Less {
        pred = curr;
        curr = unsafe { (*pred).next[level].load(Ordering::Acquire) };
      }
      if !curr.is_null() && Self::key_order(curr, key) == CmpOrdering::Equal {
        // Lock the matched node before reading its value: this makes the
        // read mutually exclusive with `insert`'s replace and `erase`'s
        // take, both of which hold the same lock, so neither a torn read
        // nor a use-after-free of the displaced value is observable.
        let guard = unsafe { (*curr).lock.lock() };
        let found: bool = unsafe { (*curr).fully_linked.load(Ordering::Acquire) && !(*curr).marked.load(Ordering::Acquire) };
        let result: Option<V> = if found {
          unsafe { (*curr.cast_const()).value.get().as_ref().unwrap_unchecked().clone() }
        } else {
          None
        };
        drop(guard);
        drop(checkout);
        return result;
      }
    }
    drop(checkout);
    None
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
    let mut node: *mut Node<K, V> = unsafe { self.head.as_ref().unwrap().next[0].load(Ordering::Acquire) };
    for level in 0..=MAX_LEVEL {
      unsafe {
        (*self.head).next[level].store(ptr::null_mut(), Ordering::Relaxed);
      }
    }
    self.len.store(0, Ordering::Relaxed);
    while !node.is_null() {
      let next: *mut Node<K, V> = unsafe { (*node).next[0].load(Ordering::Relaxed) };
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
    let mut node: *mut Node<K, V> = unsafe { (*self.head).next[0].load(Ordering::Acquire) };
    while !node.is_null() {
      unsafe {
        let guard = (*node).lock.lock();
        if (*node).fully_linked.load(Ordering::Acquire) && !(*node).marked.load(Ordering::Acquire) {
          let key: K = (*node).key.as_ref().unwrap_unchecked().clone();
          let value: V = (*(*node).value.get()).as_ref().unwrap_unchecked().clone();
          out.push((key, value));
        }
        drop(guard);
        node = (*node).next[0].load(Ordering::Acquire);
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
      let next: *mut Node<K, V> = unsafe { (*node).next[0].load(Ordering::Relaxed) };
      drop(unsafe { Box::from_raw(node) });
      node = next;
    }
  }
}
