//! Block growth policies for [`super::memory_pool::MemoryPool`] and
//! [`super::object_pool::ObjectPool`].
//!
//! Grounded in `memory_pool.hpp`'s `constant_growth_policy<N>` and
//! `geometric_growth_policy<N>`: a pool never shrinks, so the only
//! decision a policy makes is how large the *next* block should be when
//! the free list runs dry.

/// Decides how many slots the next expansion block should contain.
pub trait GrowthPolicy {
  /// Returns the slot count for the block allocated at `expansion`, where
  /// `expansion` counts prior expansions (`0` for the very first block).
  fn next_block_len(&self, expansion: usize) -> usize;
}

/// Every block is the same fixed size `N`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantGrowth<const N: usize>;

impl<const N: usize> GrowthPolicy for ConstantGrowth<N> {
  #[inline]
  fn next_block_len(&self, _expansion: usize) -> usize {
    N
  }
}

/// Each successive block doubles in size, starting from `N`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricGrowth<const N: usize>;

impl<const N: usize> GrowthPolicy for GeometricGrowth<N> {
  #[inline]
  fn next_block_len(&self, expansion: usize) -> usize {
    let shift: u32 = expansion.min(31) as u32;
    N.saturating_mul(1usize << shift)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constant_growth_is_flat() {
    let policy: ConstantGrowth<16> = ConstantGrowth;
    assert_eq!(policy.next_block_len(0), 16);
    assert_eq!(policy.next_block_len(5), 16);
  }

  #[test]
  fn geometric_growth_doubles() {
    let policy: GeometricGrowth<8> = GeometricGrowth;
    assert_eq!(policy.next_block_len(0), 8);
    assert_eq!(policy.next_block_len(1), 16);
    assert_eq!(policy.next_block_len(2), 32);
  }
}
