//! A 2-D spatial hash grid built atop [`crate::map::ConcurrentMap`].
//!
//! Grounded in `concurrent_hash_grid_2d` from `concurrent_hash_grid.hpp`;
//! see [`hash_grid`]'s module docs for the memory-reclamation policy
//! choice.

mod alloc;
mod hash_grid;
mod key;
mod traits;

pub use self::alloc::CellAllocator;
pub use self::alloc::DefaultCellAlloc;
pub use self::hash_grid::HashGrid2D;
pub use self::hash_grid::VoxelVisitor;
pub use self::key::pack_cell_key;
pub use self::key::unpack_cell_key;
pub use self::traits::GridTraits;
pub use self::traits::RegularGridTraits;
