//! Work-scheduling primitives: a work-stealing thread pool, a cooperative
//! fiber pool multiplexed over a handful of OS threads, and a
//! dependency-aware task graph layered atop either.

pub mod fiber_pool;
pub mod task_graph;
pub mod thread_pool;

pub use self::fiber_pool::FiberPool;
pub use self::fiber_pool::FiberPoolOptions;
pub use self::fiber_pool::get_fiber_thread_id;
pub use self::task_graph::TaskGraph;
pub use self::task_graph::TaskHandle;
pub use self::thread_pool::JoinHandle;
pub use self::thread_pool::ThreadHooks;
pub use self::thread_pool::ThreadPool;
pub use self::thread_pool::ThreadPoolOptions;
pub use self::thread_pool::get_thread_id;
