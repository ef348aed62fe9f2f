//! The 2-D hash grid itself: cells addressed by a packed `(i, j)` key and
//! stored as pointer values in a [`ConcurrentMap`].
//!
//! Grounded in `concurrent_hash_grid_2d` from `concurrent_hash_grid.hpp`:
//! `get_cell` follows the same insert-or-find-then-exchange protocol as
//! `get_cell`'s `insertOrFind`/`exchangeValue` there, and `erase`/`clear`
//! defer cell destruction through a memory reclamation policy the same
//! way `getMemoryReclaimer().reclaim_via_callable` does — the original
//! defaults that policy parameter to `junction::QSBRMemoryReclamationPolicy`,
//! so this grid is built directly on [`crate::reclaim::qsbr::Qsbr`] rather
//! than inventing a grid-specific scheme.

use crate::grid::alloc::CellAllocator;
use crate::grid::alloc::DefaultCellAlloc;
use crate::grid::key::pack_cell_key;
use crate::grid::key::unpack_cell_key;
use crate::grid::traits::GridTraits;
use crate::map::ConcurrentMap;
use crate::map::NULL_KEY;
use crate::reclaim::qsbr::Qsbr;
use crate::reclaim::qsbr::QsbrHandle;

/// A lazily-populated 2-D grid of `Cell` values, addressed by integer
/// `(i, j)` indices and keyed internally through a packed `u64`.
pub struct HashGrid2D<Cell, T, A = DefaultCellAlloc<Cell>> {
  map: ConcurrentMap<*mut Cell>,
  traits: T,
  alloc: A,
  reclaimer: Qsbr,
}

impl<Cell, T, A> HashGrid2D<Cell, T, A>
where
  T: GridTraits,
  A: CellAllocator<Cell>,
{
  /// Creates an empty grid over the given geometry mapping and cell
  /// allocator.
  pub fn new(traits: T, alloc: A) -> Self {
    Self {
      map: ConcurrentMap::new(),
      traits,
      alloc,
      reclaimer: Qsbr::new(),
    }
  }

  /// Registers the calling thread with this grid's reclaimer. Hold the
  /// returned handle for as long as the thread touches the grid, and call
  /// [`QsbrHandle::quiesce`] between units of work so retired cells can be
  /// freed, matching `getMemoryReclaimer().quiesce()` in the original.
  #[must_use]
  pub fn register(&self) -> QsbrHandle {
    self.reclaimer.register()
  }

  /// The grid-geometry mapping this grid was built with.
  pub fn traits(&self) -> &T {
    &self.traits
  }

  /// Whether `(x, y)` falls within the grid's declared bounds.
  pub fn is_contained(&self, x: f64, y: f64) -> bool {
    self.traits.is_contained(x, y)
  }

  fn key_for(i: u32, j: u32) -> u64 {
    let key: u64 = pack_cell_key(i, j);
    debug_assert_ne!(key, NULL_KEY, "(i, j) = (u32::MAX, u32::MAX) collides with the map's null key");
    key
  }

  /// Looks up the cell at `(i, j)` without creating it.
  pub fn find_cell(&self, i: u32, j: u32) -> Option<&Cell> {
    let ptr: *mut Cell = self.map.find(Self::key_for(i, j))?;
    // SAFETY: a non-null entry in `map` was constructed by this grid's
    // allocator and is only freed once every registered thread has
    // quiesced past its removal.
    Some(unsafe { &*ptr })
  }

  /// Looks up the cell at the grid index containing `(x, y)`.
  pub fn find_cell_at(&self, x: f64, y: f64) -> Option<&Cell> {
    self.find_cell(self.traits.x_index(x), self.traits.y_index(y))
  }

  /// Returns the cell at `(i, j)`, constructing and installing one via
  /// this grid's [`CellAllocator`] if it does not yet exist.
  pub fn get_cell(&self, i: u32, j: u32) -> &Cell {
    let key: u64 = Self::key_for(i, j);
    if let Some(ptr) = self.map.find(key) {
      return unsafe { &*ptr };
    }

    let candidate: *mut Cell = self.alloc.construct();
    let (winner, inserted) = self.map.insert(key, candidate);
    if !inserted {
      // Lost the race: another thread's cell won, drop our speculative one.
      unsafe { self.alloc.destroy(candidate) };
    }
    unsafe { &*winner }
  }

  /// Returns the cell at the grid index containing `(x, y)`.
  pub fn get_cell_at(&self, x: f64, y: f64) -> &Cell {
    self.get_cell(self.traits.x_index(x), self.traits.y_index(y))
  }

  /// Removes the cell at `(i, j)`, deferring its destruction until the
  /// grid next [`quiesce`](Self::quiesce)s past all in-flight readers.
  pub fn erase(&self, i: u32, j: u32) {
    let Some(ptr) = self.map.erase(Self::key_for(i, j)) else {
      return;
    };
    self.retire(ptr);
  }

  /// Removes every cell, deferring their destruction the same way as
  /// [`erase`](Self::erase). Not thread-safe: the caller must ensure no
  /// other thread is concurrently accessing the grid.
  pub fn clear(&self) {
    let mut displaced: Vec<*mut Cell> = Vec::new();
    self.map.for_each(|_, ptr| displaced.push(ptr));
    self.map.clear();
    for ptr in displaced {
      self.retire(ptr);
    }
  }

  /// Defers `ptr`'s destruction until every thread registered with this
  /// grid has quiesced past this point, matching
  /// `getMemoryReclaimer().reclaim_via_callable`.
  fn retire(&self, ptr: *mut Cell) {
    // The allocator is borrowed for the grid's lifetime; the deferred
    // closure cannot outlive it since `Drop` destroys every remaining
    // cell directly rather than going through `reclaimer`.
    let alloc: *const A = std::ptr::from_ref(&self.alloc);
    struct SendableAllocPtr<A>(*const A);
    unsafe impl<A> Send for SendableAllocPtr<A> {}
    let alloc = SendableAllocPtr(alloc);
    // SAFETY: `ptr` was removed from `map` by the caller just before this
    // call, so no future `find`/`get_cell` can hand it out again.
    unsafe {
      self.reclaimer.reclaim_via_callable(
        move |p: *mut Cell| {
          let SendableAllocPtr(alloc) = alloc;
          unsafe { (*alloc).destroy(p) };
        },
        ptr,
      );
    }
  }

  /// Visits every live `(i, j, &Cell)` triple. Not snapshot-consistent,
  /// matching `concurrent_hash_grid_2d::for_each`.
  pub fn for_each(&self, mut f: impl FnMut(u32, u32, &Cell)) {
    self.map.for_each(|key, ptr| {
      let (i, j) = unpack_cell_key(key);
      f(i, j, unsafe { &*ptr });
    });
  }

  /// Announces quiescence on `handle`'s behalf and drains any retired
  /// cells every registered thread has since passed, matching
  /// `concurrent_hash_grid_2d::quiesce`'s delegate to its memory
  /// reclaimer. Call this when the calling thread is not in the middle of
  /// reading a cell obtained from this grid.
  pub fn quiesce(&self, handle: &QsbrHandle) {
    handle.quiesce();
    self.reclaimer.flush();
    self.map.quiesce();
  }
}

impl<Cell, T, A> Drop for HashGrid2D<Cell, T, A>
where
  A: CellAllocator<Cell>,
{
  fn drop(&mut self) {
    let mut displaced: Vec<*mut Cell> = Vec::new();
    self.map.for_each(|_, ptr| displaced.push(ptr));
    for ptr in displaced {
      unsafe { self.alloc.destroy(ptr) };
    }
  }
}

unsafe impl<Cell: Send, T: Send, A: Send> Send for HashGrid2D<Cell, T, A> {}
unsafe impl<Cell: Sync, T: Sync, A: Sync> Sync for HashGrid2D<Cell, T, A> {}

/// Dispatch seam for geometry-driven grid traversal (point, segment,
/// polyline, polygon). Index enumeration itself — walking the cells a
/// given shape overlaps — is an external voxel-traversal collaborator's
/// job (geometry enumeration is out of this crate's scope); a
/// caller implements `VoxelVisitor` and drives [`HashGrid2D::visit_indices`]
/// with whatever index sequence its traverser produces.
pub trait VoxelVisitor<Cell> {
  /// Called once per visited `(i, j)` cell. Returning `false` stops the
  /// traversal early.
  fn visit(&mut self, i: u32, j: u32, cell: Option<&Cell>) -> bool;
}

impl<Cell, T, A> HashGrid2D<Cell, T, A>
where
  T: GridTraits,
  A: CellAllocator<Cell>,
{
  /// Feeds an externally-enumerated sequence of `(i, j)` indices (as
  /// produced by a point lookup, a line traversal, or a polygon
  /// rasterizer) through `visitor`, looking up (not creating) each cell.
  pub fn visit_indices(&self, indices: impl IntoIterator<Item = (u32, u32)>, visitor: &mut impl VoxelVisitor<Cell>) {
    for (i, j) in indices {
      let cell: Option<&Cell> = self.find_cell(i, j);
      if !visitor.visit(i, j, cell) {
        break;
      }
    }
  }

  /// The single-cell case of [`visit_indices`](Self::visit_indices): looks
  /// up the cell containing `(x, y)` and visits it.
  pub fn visit_point(&self, x: f64, y: f64, visitor: &mut impl VoxelVisitor<Cell>) {
    let i: u32 = self.traits.x_index(x);
    let j: u32 = self.traits.y_index(y);
    self.visit_indices(core::iter::once((i, j)), visitor);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::grid::traits::RegularGridTraits;
  use std::sync::Arc;
  use std::sync::atomic::AtomicU64;
  use std::sync::atomic::Ordering;
  use std::thread;

  fn traits() -> RegularGridTraits {
    RegularGridTraits {
      min_x: 0.0,
      min_y: 0.0,
      max_x: 1000.0,
      max_y: 1000.0,
      cell_size: 10.0,
    }
  }

  #[derive(Default)]
  struct Counter(AtomicU64);

  #[test]
  fn find_cell_absent_returns_none() {
    let grid: HashGrid2D<Counter, _> = HashGrid2D::new(traits(), DefaultCellAlloc::new());
    assert!(grid.find_cell(1, 1).is_none());
  }

  #[test]
  fn get_cell_creates_then_reuses() {
    let grid: HashGrid2D<Counter, _> = HashGrid2D::new(traits(), DefaultCellAlloc::new());
    let a: &Counter = grid.get_cell(3, 4);
    a.0.fetch_add(1, Ordering::Relaxed);
    let b: &Counter = grid.get_cell(3, 4);
    assert_eq!(b.0.load(Ordering::Relaxed), 1);
    assert!(std::ptr::eq(a, b));
  }

  #[test]
  fn erase_removes_cell() {
    let grid: HashGrid2D<Counter, _> = HashGrid2D::new(traits(), DefaultCellAlloc::new());
    let handle = grid.register();
    grid.get_cell(1, 1);
    assert!(grid.find_cell(1, 1).is_some());
    grid.erase(1, 1);
    assert!(grid.find_cell(1, 1).is_none());
    grid.quiesce(&handle);
  }

  #[test]
  fn for_each_visits_every_cell() {
    let grid: HashGrid2D<Counter, _> = HashGrid2D::new(traits(), DefaultCellAlloc::new());
    for i in 0..5u32 {
      grid.get_cell(i, i);
    }
    let mut seen: Vec<(u32, u32)> = Vec::new();
    grid.for_each(|i, j, _| seen.push((i, j)));
    seen.sort_unstable();
    assert_eq!(seen, (0..5u32).map(|i| (i, i)).collect::<Vec<_>>());
  }

  #[test]
  fn visit_point_dispatches_through_visitor_seam() {
    let grid: HashGrid2D<Counter, _> = HashGrid2D::new(traits(), DefaultCellAlloc::new());
    grid.get_cell(2, 2);

    struct Recorder(Vec<(u32, u32, bool)>);
    impl VoxelVisitor<Counter> for Recorder {
      fn visit(&mut self, i: u32, j: u32, cell: Option<&Counter>) -> bool {
        self.0.push((i, j, cell.is_some()));
        true
      }
    }

    let mut recorder = Recorder(Vec::new());
    grid.visit_point(25.0, 25.0, &mut recorder);
    assert_eq!(recorder.0, vec![(2, 2, true)]);
  }

  #[test]
  fn concurrent_get_cell_installs_exactly_once() {
    let grid: Arc<HashGrid2D<Counter, RegularGridTraits>> = Arc::new(HashGrid2D::new(traits(), DefaultCellAlloc::new()));

    thread::scope(|scope| {
      for _ in 0..8 {
        let grid: Arc<HashGrid2D<Counter, RegularGridTraits>> = Arc::clone(&grid);
        scope.spawn(move || {
          for _ in 0..200 {
            grid.get_cell(7, 7).0.fetch_add(1, Ordering::Relaxed);
          }
        });
      }
    });

    assert_eq!(grid.get_cell(7, 7).0.load(Ordering::Relaxed), 1600);
  }
}
