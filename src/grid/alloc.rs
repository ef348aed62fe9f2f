//! Pluggable cell construction for [`super::HashGrid2D`], mirroring
//! `detail::DefaultDataAllocator<T>` from `concurrent_hash_grid.hpp`.

/// Constructs and destroys heap-allocated grid cells.
pub trait CellAllocator<Cell> {
  /// Allocates and initializes a new cell.
  fn construct(&self) -> *mut Cell;

  /// Destroys a cell previously returned by [`construct`](Self::construct).
  ///
  /// # Safety
  ///
  /// `cell` must have come from this allocator's `construct` and must not
  /// be used again afterwards.
  unsafe fn destroy(&self, cell: *mut Cell);
}

/// The default cell allocator: ordinary heap `Box` allocation, matching
/// `DefaultDataAllocator`'s `new`/`delete` pair.
#[derive(Default)]
pub struct DefaultCellAlloc<Cell>(core::marker::PhantomData<fn() -> Cell>);

impl<Cell> DefaultCellAlloc<Cell> {
  /// Creates a new default allocator instance.
  #[must_use]
  pub fn new() -> Self {
    Self(core::marker::PhantomData)
  }
}

impl<Cell: Default> CellAllocator<Cell> for DefaultCellAlloc<Cell> {
  fn construct(&self) -> *mut Cell {
    Box::into_raw(Box::new(Cell::default()))
  }

  unsafe fn destroy(&self, cell: *mut Cell) {
    drop(unsafe { Box::from_raw(cell) });
  }
}

unsafe impl<Cell> Send for DefaultCellAlloc<Cell> {}
unsafe impl<Cell> Sync for DefaultCellAlloc<Cell> {}
