//! Memory reclamation schemes for readers that walk lock-free structures
//! without a garbage collector.
//!
//! Three schemes are provided, each trading off differently between
//! reader overhead and reclamation latency:
//!
//! - [`qsbr`] — quiescent-state-based reclamation; readers announce safe
//!   points, no per-access bookkeeping.
//! - [`rcr`] — reference-counted reclamation with the live-checkout count
//!   packed alongside the deferred list's head pointer.
//! - [`rcnm`] — a plain atomic refcount guarding a mutex-protected pending
//!   list, with an atomic fast path for the common empty case.

pub mod qsbr;
pub mod rcnm;
pub mod rcr;

pub use self::qsbr::Qsbr;
pub use self::qsbr::QsbrHandle;
pub use self::rcnm::RefCountedNodeManager;
pub use self::rcr::RefCountedReclaimer;
