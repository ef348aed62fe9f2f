//! Bounded multi-producer multi-consumer queues.

pub mod vyukov;

pub use self::vyukov::BoundedQueue;
