//! Two skip list map variants sharing one [`OrderedMap`] contract: a
//! fine-grained lock-based map grounded in Herlihy & Shavit's lazy skip
//! list, and a fully lock-free map grounded in their marked-pointer variant.

mod level;
mod locked;
mod lockfree;
mod ordered_map;

pub use self::level::MAX_LEVEL;
pub use self::level::coin_flip_level;
pub use self::locked::SkipListMap as LockedSkipListMap;
pub use self::lockfree::SkipListMap as LockFreeSkipListMap;
pub use self::ordered_map::OrderedMap;
