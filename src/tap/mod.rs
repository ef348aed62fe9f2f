//! Tagged atomic pointers (TAP): single-word compare-and-swap over a
//! pointer plus a small piece of ABA-resistant metadata.
//!
//! Two shapes are provided:
//!
//! - [`markable::AtomicMarkedPtr`] packs a single mark bit into the
//!   pointer's low bit; stored pointers must be at least 2-aligned.
//! - [`stampable::AtomicStampedPtr`] packs a 16-bit stamp into the high
//!   16 bits of a 64-bit word; stored pointers must be canonical 48-bit
//!   addresses (true of x86-64 and AArch64 userspace pointers).
//!
//! Both variants derive the failure memory order for a compare-exchange
//! from the requested success order via [`failure_order`], matching the
//! rule used throughout the original C++ implementation: `AcqRel`
//! degrades to `Acquire`, `Release` degrades to `Relaxed`, anything else
//! is unchanged.

pub mod markable;
pub mod stampable;

pub use self::markable::AtomicMarkedPtr;
pub use self::stampable::AtomicStampedPtr;

use core::sync::atomic::Ordering;

/// Derives the failure ordering for a `compare_exchange` from its success
/// ordering, per the C++17 `atomic_compare_exchange` rules the original
/// toolkit follows: `AcqRel -> Acquire`, `Release -> Relaxed`, otherwise
/// unchanged.
#[inline]
#[must_use]
pub const fn failure_order(order: Ordering) -> Ordering {
  match order {
    Ordering::AcqRel => Ordering::Acquire,
    Ordering::Release => Ordering::Relaxed,
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn derives_failure_order() {
    assert_eq!(failure_order(Ordering::AcqRel), Ordering::Acquire);
    assert_eq!(failure_order(Ordering::Release), Ordering::Relaxed);
    assert_eq!(failure_order(Ordering::Acquire), Ordering::Acquire);
    assert_eq!(failure_order(Ordering::Relaxed), Ordering::Relaxed);
    assert_eq!(failure_order(Ordering::SeqCst), Ordering::SeqCst);
  }
}
