//! A systems toolkit of lock-free concurrent data structures and
//! thread/fiber execution primitives.
//!
//! `stk` is organized around a small set of building blocks that the
//! higher-level structures share:
//!
//! - [`tap`]: single-word tagged atomic pointers (a mark bit, or a 16-bit
//!   stamp) used to attach metadata to a pointer without a second word.
//! - [`reclaim`]: memory reclamation schemes (QSBR, a ref-counted
//!   reclaimer, a ref-counted node manager) that let lock-free readers and
//!   writers agree on when a retired node is safe to free.
//! - [`mpmc`]: a bounded, lock-free multi-producer multi-consumer queue.
//! - [`pool`]: block-growing object pools with O(1) owning-pool recovery.
//!
//! On top of those sit the concurrent collections and the work-stealing
//! execution engine:
//!
//! - [`map`]: a lock-free hash map from `u64` keys to an integral or
//!   pointer value domain.
//! - [`grid`]: a 2-D spatial hash grid built on [`map`].
//! - [`skiplist`]: ordered maps, in both a fine-grained-locked and a
//!   fully lock-free flavor.
//! - [`vector`]: a lock-free, dynamically growable vector.
//! - [`executor`]: a work-stealing thread pool, a cooperative fiber pool,
//!   and a task graph scheduler built atop both.
//!
//! # Usage
//!
//! ```
//! use stk::map::ConcurrentMap;
//!
//! let map: ConcurrentMap<u64> = ConcurrentMap::new();
//! map.insert(1, 100);
//! assert_eq!(map.find(1), Some(100));
//! ```
//!
//! [ABA problem]: https://en.wikipedia.org/wiki/ABA_problem

pub mod executor;
pub mod grid;
pub mod map;
pub mod mpmc;
pub mod pool;
pub mod reclaim;
pub mod skiplist;
pub mod tap;
mod util;
pub mod vector;

#[cfg(all(loom, shuttle))]
compile_error!("cannot use loom and shuttle at once");
