//! Small shared utilities used across the concurrent containers and
//! executors: cache-line padding, a bounded-backoff spin lock, and a fast
//! PRNG for level selection / steal-victim choice.

pub mod padded;
pub mod rng;
pub mod spin;

pub use self::padded::CachePadded;
pub use self::rng::XorShift;
pub use self::spin::SpinLock;
