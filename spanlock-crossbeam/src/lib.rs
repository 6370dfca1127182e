//! Epoch-based memory reclamation for spanlock range locks.
//!
//! Provides [`EpochGuard`], the production [`Guard`](spanlock_core::Guard)
//! implementation backed by crossbeam-epoch:
//!
//! ```ignore
//! use spanlock_core::{LockFreeRangeLock, RangeLock};
//! use spanlock_crossbeam::EpochGuard;
//!
//! let lock: LockFreeRangeLock<EpochGuard> = LockFreeRangeLock::new();
//! assert!(lock.try_lock(10, 20));
//! assert!(lock.release_lock(10, 20));
//! ```

mod epoch_guard;

pub use epoch_guard::EpochGuard;
