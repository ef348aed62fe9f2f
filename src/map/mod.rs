//! A lock-free hash map keyed by `u64`, with value types restricted to
//! either an integral type or a raw pointer (see [`value::ValueTraits`]).
//!
//! Grounded in `concurrent_pointer_unordered_map.hpp` and
//! `concurrent_numeric_unordered_map.hpp`'s shared external contract; see
//! [`concurrent_map`]'s module docs for how the probe algorithm itself
//! differs from the closed-source `junction::ConcurrentMap_Leapfrog` those
//! headers wrap.

mod concurrent_map;
mod hash;
mod value;

pub use self::concurrent_map::ConcurrentMap;
pub use self::concurrent_map::NULL_KEY;
pub use self::hash::avalanche;
pub use self::hash::deavalanche;
pub use self::value::ValueTraits;

/// A ready-made value domain for maps storing 64-bit integers, mirroring
/// `uint64_key_traits`'s value half. An alias rather than a wrapper type:
/// [`ValueTraits`] is implemented directly on `u64`, so `ConcurrentMap<IntegralValue>`
/// and `ConcurrentMap<u64>` name the same map.
pub type IntegralValue = u64;

/// A ready-made value domain for maps storing pointers, mirroring
/// `pointer_value_traits<T>`. An alias over the direct `ValueTraits` impl
/// on `*mut T`.
pub type PointerValue<T> = *mut T;
