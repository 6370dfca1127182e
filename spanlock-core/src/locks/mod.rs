//! The four range lock implementations.
//!
//! - [`LockFreeRangeLock`] - Harris-Michael skip list, CAS-only
//! - [`OptimisticRangeLock`] - lazy skip list, per-node mutexes
//! - [`SortedListRangeLock`] - single-level Harris list
//! - [`CoarseRangeLock`] - skip list behind one global mutex

pub mod coarse_skip_list;
pub mod lock_free_skip_list;
pub mod optimistic_skip_list;
pub mod sorted_list;

pub use coarse_skip_list::CoarseRangeLock;
pub use lock_free_skip_list::LockFreeRangeLock;
pub use optimistic_skip_list::OptimisticRangeLock;
pub use sorted_list::SortedListRangeLock;
