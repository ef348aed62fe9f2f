//! A small, fast, non-cryptographic PRNG used for skip list level selection
//! and work-stealing victim selection.
//!
//! Random-number *distributions* are an explicit external collaborator of
//! this crate; this generator exists only to drive coin flips and uniform
//! index picks on hot paths where pulling in a full distribution library
//! would be overkill.

use core::cell::Cell;

/// An xorshift generator, seeded per-thread from [`std::time`]/the address
/// of a stack variable so distinct threads diverge without coordination.
#[derive(Debug)]
pub struct XorShift {
  state: Cell<u64>,
}

impl XorShift {
  #[inline]
  #[must_use]
  pub const fn new(seed: u64) -> Self {
    // xorshift requires a non-zero seed.
    Self {
      state: Cell::new(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed }),
    }
  }

  /// Returns the next pseudo-random `u64`.
  #[inline]
  pub fn next_u64(&self) -> u64 {
    let mut x: u64 = self.state.get();
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    self.state.set(x);
    x
  }

  /// Returns a pseudo-random value uniformly distributed in `0..bound`.
  ///
  /// Returns `0` when `bound == 0`.
  #[inline]
  pub fn next_below(&self, bound: u32) -> u32 {
    if bound == 0 {
      return 0;
    }
    // Not perfectly uniform for non-power-of-two bounds, adequate for
    // steal-victim selection and test seeding.
    (self.next_u64() % u64::from(bound)) as u32
  }

  /// Flips a fair coin using the high bit of a fresh word.
  #[inline]
  pub fn coin_flip(&self) -> bool {
    self.next_u64() & 1 != 0
  }
}

thread_local! {
  static THREAD_RNG: XorShift = XorShift::new(thread_seed());
}

fn thread_seed() -> u64 {
  use std::time::SystemTime;
  use std::time::UNIX_EPOCH;

  let nanos: u128 = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or(0);

  // Mix in a stack address so distinct threads diverge even when the
  // clock resolution is too coarse to separate them.
  let stack_marker: u8 = 0;
  let addr: u64 = (&raw const stack_marker) as u64;
  (nanos as u64) ^ addr.rotate_left(17)
}

/// Runs `f` with access to the calling thread's RNG instance.
#[inline]
pub fn with_thread_rng<R>(f: impl FnOnce(&XorShift) -> R) -> R {
  THREAD_RNG.with(f)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn produces_distinct_values() {
    let rng: XorShift = XorShift::new(42);
    let a: u64 = rng.next_u64();
    let b: u64 = rng.next_u64();
    assert_ne!(a, b);
  }

  #[test]
  fn rejects_zero_seed() {
    let rng: XorShift = XorShift::new(0);
    assert_ne!(rng.next_u64(), 0);
  }

  #[test]
  fn next_below_respects_bound() {
    let rng: XorShift = XorShift::new(7);
    for _ in 0..1000 {
      assert!(rng.next_below(16) < 16);
    }
    assert_eq!(rng.next_below(0), 0);
  }
}
