//! Pool allocators: blocks of pre-allocated slots handed out and returned
//! through a lock-free free list, growing on demand but never shrinking.

mod base;
pub mod growth;
pub mod memory_pool;
pub mod object_pool;

pub use self::growth::ConstantGrowth;
pub use self::growth::GeometricGrowth;
pub use self::growth::GrowthPolicy;
pub use self::memory_pool::MemoryPool;
pub use self::memory_pool::PooledPtr;
pub use self::memory_pool::pool_of;
pub use self::object_pool::ObjectPool;
pub use self::object_pool::PooledHandle;
