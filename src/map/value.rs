//! Value traits: every `ConcurrentMap` reserves two sentinel bit patterns
//! in its value domain — `NULL` marks an empty slot, `REDIRECT` marks a
//! slot whose entry has migrated to a newer table during resize — so that
//! both can be told apart from genuine user values with a single atomic
//! word compare.
//!
//! Grounded in `pointer_value_traits`/the integral specializations
//! implied by `concurrent_numeric_unordered_map.hpp`: pointer values
//! reserve `0`/`1`, integral values reserve `max`/`max - 1`.

/// A value type storable in a [`super::ConcurrentMap`] slot as a single
/// atomic `u64`, with two bit patterns reserved as sentinels.
pub trait ValueTraits: Copy {
  /// Marks an empty slot.
  const NULL: u64;
  /// Marks a slot whose value has migrated to a newer table.
  const REDIRECT: u64;

  /// Packs `self` into its atomic-word representation.
  fn to_bits(self) -> u64;

  /// Unpacks a previously-[`to_bits`](Self::to_bits)-produced word.
  ///
  /// # Safety
  ///
  /// `bits` must not equal [`Self::NULL`] or [`Self::REDIRECT`] — callers
  /// are expected to check those sentinels before unpacking.
  unsafe fn from_bits(bits: u64) -> Self;

  /// Whether `bits` is one of the two reserved sentinel values.
  #[inline]
  fn is_reserved(bits: u64) -> bool {
    bits == Self::NULL || bits == Self::REDIRECT
  }
}

/// `u64`-valued maps reserve the two largest representable values,
/// matching the integral specializations implied alongside
/// `pointer_value_traits` for non-pointer value domains.
impl ValueTraits for u64 {
  const NULL: u64 = u64::MAX;
  const REDIRECT: u64 = u64::MAX - 1;

  #[inline]
  fn to_bits(self) -> u64 {
    debug_assert!(!Self::is_reserved(self), "value collides with a reserved sentinel");
    self
  }

  #[inline]
  unsafe fn from_bits(bits: u64) -> Self {
    bits
  }
}

/// Pointer-valued maps reserve `0` (null) and `1` (a dangling but
/// non-null sentinel) exactly as `pointer_value_traits<Data>` does. A
/// null pointer is never a valid value: `NOTE: Does not support holding
/// null ptrs as data`, carried over from `concurrent_pointer_unordered_map`.
impl<T> ValueTraits for *mut T {
  const NULL: u64 = 0;
  const REDIRECT: u64 = 1;

  #[inline]
  fn to_bits(self) -> u64 {
    let bits: u64 = self as u64;
    debug_assert!(!Self::is_reserved(bits), "pointer value is null or the redirect sentinel");
    bits
  }

  #[inline]
  unsafe fn from_bits(bits: u64) -> Self {
    bits as *mut T
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn u64_reserves_top_two_values() {
    assert!(u64::is_reserved(u64::MAX));
    assert!(u64::is_reserved(u64::MAX - 1));
    assert!(!u64::is_reserved(0));
    assert!(!u64::is_reserved(42));
  }

  #[test]
  fn pointer_reserves_null_and_one() {
    assert!(<*mut u64>::is_reserved(0));
    assert!(<*mut u64>::is_reserved(1));
    assert!(!<*mut u64>::is_reserved(0x1000));
  }

  #[test]
  fn pointer_round_trips() {
    let mut value: u64 = 7;
    let ptr: *mut u64 = &raw mut value;
    let bits: u64 = ValueTraits::to_bits(ptr);
    let back: *mut u64 = unsafe { <*mut u64 as ValueTraits>::from_bits(bits) };
    assert_eq!(ptr, back);
  }
}
