//! Guard trait for memory reclamation strategies.
//!
//! The lock-free and optimistic range locks unlink nodes while other threads
//! may still be traversing them, so a retired node's storage can be released
//! only after every traversal that observed it as reachable has finished.
//! The `Guard` trait abstracts over how that grace period is enforced:
//!
//! ```text
//! LockFreeRangeLock<EpochGuard>      - production: epoch-based reclamation
//! LockFreeRangeLock<DeferredGuard>   - testing: defers all destruction
//! ```
//!
//! The guard stored in a lock is used for deferred destruction scheduling.
//! Actual thread pinning (for epoch-based guards) happens per operation,
//! not when the guard is created.

mod deferred_guard;

pub use deferred_guard::DeferredGuard;

/// A memory reclamation guard protecting concurrent access to unlinked nodes.
///
/// # Safety Contract
///
/// Implementations must ensure nodes passed to `defer_destroy` are not freed
/// while a thread holding a `ReadGuard` pinned before the call could still
/// reach them.
///
pub trait Guard: Sized + Default + Send + Sync {
    /// An active guard that protects reads for its lifetime.
    ///
    /// For epoch-based guards this holds a pinned epoch guard; for the
    /// deferred guard it is a unit type, since protection comes from the
    /// lock's stored guard.
    ///
    type ReadGuard: Sized;

    /// Pin an active read guard for the duration of one operation.
    fn pin() -> Self::ReadGuard;

    /// Schedule a node for deferred destruction.
    ///
    /// # Safety
    ///
    /// - `node` must be a valid pointer previously allocated by the caller
    /// - `node` must be unlinked (not reachable by any new traversal)
    /// - `dealloc` must be the matching deallocation function for `node`
    /// - `node` must be retired at most once
    ///
    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N));
}
