//! Wang's 64-bit integer avalanche mix and its inverse.
//!
//! `turf::util::avalanche`/`deavalanche` back every key-traits
//! specialization in the original (`uint64_key_traits::hash`/`dehash`);
//! `turf` is a C++-only dependency with no Rust port in the reference
//! pack, so the well-known invertible 64-bit mix is reproduced directly.

/// Scrambles `key` into a well-distributed 64-bit hash.
#[inline]
#[must_use]
pub const fn avalanche(mut key: u64) -> u64 {
  key = (!key).wrapping_add(key << 21);
  key ^= key >> 24;
  key = key.wrapping_add(key << 3).wrapping_add(key << 8);
  key ^= key >> 14;
  key = key.wrapping_add(key << 2).wrapping_add(key << 4);
  key ^= key >> 28;
  key = key.wrapping_add(key << 31);
  key
}

/// Inverts `y = x ^ (x >> shift)` for `x`, given `y`.
///
/// Each iteration recovers one more `shift`-sized band of high bits, so
/// `ceil(64 / shift)` iterations fully converge for any `shift` in `1..64`.
#[inline]
const fn invert_xorshift_right(y: u64, shift: u32) -> u64 {
  let iterations: u32 = u64::BITS.div_ceil(shift);
  let mut x: u64 = y;
  let mut i: u32 = 0;
  while i < iterations {
    x = y ^ (x >> shift);
    i += 1;
  }
  x
}

/// Computes the multiplicative inverse of odd `a` modulo `2^64`, via
/// Newton's iteration (`x *= 2 - a*x`, doubling the number of correct bits
/// each pass). Six passes take the one correct bit every odd number starts
/// with up to all 64.
#[inline]
const fn mod_inverse(a: u64) -> u64 {
  debug_assert!(a & 1 == 1, "only odd values are invertible mod 2^64");
  let mut x: u64 = 1;
  let mut i: u32 = 0;
  while i < 6 {
    x = x.wrapping_mul(2u64.wrapping_sub(a.wrapping_mul(x)));
    i += 1;
  }
  x
}

/// Inverts `y = x * a` (wrapping) for `x`, given odd `a` and `y`.
#[inline]
const fn invert_mul(y: u64, a: u64) -> u64 {
  y.wrapping_mul(mod_inverse(a))
}

/// Inverts [`avalanche`]: `deavalanche(avalanche(k)) == k` for all `k`.
#[inline]
#[must_use]
pub const fn deavalanche(mut hash: u64) -> u64 {
  // Undo `key += key << 31`, i.e. `key_new = key_old * (1 + 2^31)`.
  hash = invert_mul(hash, 1u64.wrapping_add(1 << 31));

  // Undo `key ^= key >> 28`.
  hash = invert_xorshift_right(hash, 28);

  // Undo `key += (key << 2) + (key << 4)`, i.e. `key_new = key_old * 21`.
  hash = invert_mul(hash, 21);

  // Undo `key ^= key >> 14`.
  hash = invert_xorshift_right(hash, 14);

  // Undo `key += (key << 3) + (key << 8)`, i.e. `key_new = key_old * 265`.
  hash = invert_mul(hash, 265);

  // Undo `key ^= key >> 24`.
  hash = invert_xorshift_right(hash, 24);

  // Undo `key = (~key) + (key << 21)`, i.e. `key_new = key_old*(2^21-1) - 1`.
  hash = invert_mul(hash.wrapping_add(1), (1u64 << 21) - 1);

  hash
}
