//! Packs a `(i, j)` cell index pair into the single `u64` key
//! [`crate::map::ConcurrentMap`] requires.
//!
//! Grounded in `stk::compressed_integer_pair`: the low 32 bits hold `i`,
//! the high 32 bits hold `j`.

/// Packs `(i, j)` into a single `u64` map key.
#[inline]
#[must_use]
pub const fn pack_cell_key(i: u32, j: u32) -> u64 {
  (u64::from(j) << 32) | u64::from(i)
}

/// Inverts [`pack_cell_key`].
#[inline]
#[must_use]
pub const fn unpack_cell_key(key: u64) -> (u32, u32) {
  (key as u32, (key >> 32) as u32)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips() {
    for (i, j) in [(0u32, 0u32), (1, 0), (0, 1), (u32::MAX, u32::MAX), (12345, 67890)] {
      assert_eq!(unpack_cell_key(pack_cell_key(i, j)), (i, j));
    }
  }

  #[test]
  fn packs_without_collision() {
    assert_ne!(pack_cell_key(1, 0), pack_cell_key(0, 1));
  }
}
