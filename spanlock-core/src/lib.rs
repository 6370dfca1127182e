//! Concurrent range locks over half-open `u64` intervals.
//!
//! A range lock arbitrates exclusive access to arbitrary intervals
//! `[start, end)`: `try_lock` inserts an interval unless it overlaps a held
//! one, `release_lock` removes it. Four implementations share the
//! [`RangeLock`] contract, each with a different concurrency discipline:
//!
//! | Implementation | Discipline |
//! |---|---|
//! | [`LockFreeRangeLock`] | Harris-Michael skip list: per-level marked references, CAS insertion, lazy deletion |
//! | [`OptimisticRangeLock`] | Lazy skip list: per-node mutexes, validate after locking |
//! | [`SortedListRangeLock`] | Single-level Harris list with overlap comparison |
//! | [`CoarseRangeLock`] | Skip list behind one global mutex (baseline) |
//!
//! The lock-free variants are generic over a memory reclamation [`Guard`]:
//! use [`DeferredGuard`] in tests and the epoch-based guard from
//! `spanlock-crossbeam` in production.

pub mod common_tests;
pub mod guard;
pub(crate) mod internal;
pub mod interval;
pub mod locks;
pub mod range_lock;

pub use guard::{DeferredGuard, Guard};
pub use interval::Interval;
pub use locks::{CoarseRangeLock, LockFreeRangeLock, OptimisticRangeLock, SortedListRangeLock};
pub use range_lock::{RangeLock, RangeLockKind};
