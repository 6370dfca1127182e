//! Deferred guard implementation for testing.

#[cfg(debug_assertions)]
use std::collections::HashSet;
use std::sync::Mutex;

use super::Guard;

/// A simple guard that defers all node destruction until the guard is
/// dropped (i.e. until the owning lock is dropped).
///
/// Useful in tests where destruction timing must be predictable. Not
/// suitable for long-running production use: retired nodes accumulate for
/// the lifetime of the lock.
///
/// # Thread Safety
///
/// Retired nodes are collected behind a `Mutex` and freed on drop.
///
pub struct DeferredGuard {
    deferred: Mutex<Vec<DeferredNode>>,
    #[cfg(debug_assertions)]
    seen: Mutex<HashSet<usize>>,
}

struct DeferredNode {
    ptr: *mut (),
    dealloc: unsafe fn(*mut ()),
}

// Safety: only the pointer and its deallocation function are stored, and
// access is synchronized by the Mutex.
unsafe impl Send for DeferredNode {}

impl DeferredGuard {
    pub fn new() -> Self {
        DeferredGuard {
            deferred: Mutex::new(Vec::new()),
            #[cfg(debug_assertions)]
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for DeferredGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        let nodes = self.deferred.get_mut().unwrap();
        for node in nodes.drain(..) {
            unsafe {
                (node.dealloc)(node.ptr);
            }
        }
    }
}

impl Guard for DeferredGuard {
    /// No-op: protection is provided by the stored guard, which outlives
    /// every operation on the owning lock.
    type ReadGuard = ();

    fn pin() -> Self::ReadGuard {}

    unsafe fn defer_destroy<N>(&self, node: *mut N, dealloc: unsafe fn(*mut N)) {
        #[cfg(debug_assertions)]
        {
            let addr = node as usize;
            let mut seen = self.seen.lock().unwrap();
            assert!(seen.insert(addr), "node {addr:#x} retired twice");
        }

        let node = DeferredNode {
            ptr: node as *mut (),
            dealloc: unsafe {
                std::mem::transmute::<unsafe fn(*mut N), unsafe fn(*mut ())>(dealloc)
            },
        };
        self.deferred.lock().unwrap().push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn dealloc_box(ptr: *mut i32) {
        unsafe { drop(Box::from_raw(ptr)) };
    }

    #[test]
    fn test_deferred_guard_basic() {
        let guard = DeferredGuard::default();
        let ptr = Box::into_raw(Box::new(42i32));
        unsafe {
            guard.defer_destroy(ptr, dealloc_box);
        }
        // Guard dropped here; the node is freed.
    }

    #[test]
    fn test_multiple_deferred_nodes() {
        let guard = DeferredGuard::default();
        for i in 0..10 {
            let ptr = Box::into_raw(Box::new(i));
            unsafe {
                guard.defer_destroy(ptr, dealloc_box);
            }
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "retired twice")]
    fn test_double_retire_is_detected() {
        let guard = DeferredGuard::default();
        let ptr = Box::into_raw(Box::new(1i32));
        unsafe {
            guard.defer_destroy(ptr, dealloc_box);
            guard.defer_destroy(ptr, dealloc_box);
        }
    }
}
