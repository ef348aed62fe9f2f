//! A lock-free resizable vector with geometric bucket growth.
//!
//! Grounded in `concurrent_vector` from `concurrent_vector.hpp`; see
//! [`concurrent_vec`]'s module docs for the descriptor-based push/pop
//! protocol.

mod concurrent_vec;
mod descriptor;
mod layout;

pub use self::concurrent_vec::ConcurrentVec;
pub use self::descriptor::WriteState;
pub use self::layout::bucket_for;
pub use self::layout::hibit;
