use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::guard::Guard;
use crate::internal::random_level;
use crate::interval::Interval;
use crate::range_lock::RangeLock;

const MAX_LEVEL: usize = 10;
const LEVELS: usize = MAX_LEVEL + 1;

type NodePtr = *mut LazyNode;

// =============================================================================
// OPTIMISTIC RANGE LOCK (lazy skip list over intervals)
// =============================================================================
//
// Traversals never lock and never help; mutation takes per-node mutexes and
// re-validates afterwards:
//
//   try_lock:     walk → lock predecessors (bottom-up) → validate → splice
//   release_lock: walk → lock victim, flip marked → lock predecessors →
//                 validate → unlink top-down
//
// A node is live once `fully_linked` is set and until `marked` is set;
// `marked = true` is the linearisation point of release, the validation
// under locks the linearisation point of acquire.
//
// Deadlock freedom: predecessor locks are always taken in ascending level
// order, and release locks the victim before any predecessor. A locker
// tracks what it holds so shared predecessors are locked once and released
// on every exit path.
//
// Walks advance while `start >= curr.end`, so the stop node is the first
// interval ending past the candidate's start; it overlaps iff it also
// begins before the candidate's end.
//
// =============================================================================

struct LazyNode {
    interval: Interval,
    top_level: usize,
    next: Box<[AtomicPtr<LazyNode>]>,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    lock: Mutex<()>,
}

impl LazyNode {
    fn alloc(interval: Interval, top_level: usize) -> NodePtr {
        let next = (0..=top_level)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Box::into_raw(Box::new(LazyNode {
            interval,
            top_level,
            next,
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            lock: Mutex::new(()),
        }))
    }

    /// # Safety
    /// The pointer must have been produced by `alloc` and not freed before.
    unsafe fn dealloc_node(node: NodePtr) {
        unsafe { drop(Box::from_raw(node)) };
    }

    #[inline]
    fn forward(&self, level: usize) -> NodePtr {
        self.next[level].load(Ordering::Acquire)
    }

    #[inline]
    fn set_forward(&self, level: usize, node: NodePtr) {
        self.next[level].store(node, Ordering::Release);
    }
}

/// Tracks the nodes locked during one validation attempt and releases them
/// in reverse order on every exit path.
struct NodeLocker {
    locked: Vec<NodePtr>,
}

impl NodeLocker {
    fn new() -> Self {
        NodeLocker { locked: Vec::new() }
    }

    /// Lock the node unless this locker already holds it.
    ///
    /// # Safety
    /// `node` must be valid and must stay valid until the locker drops.
    unsafe fn lock(&mut self, node: NodePtr) {
        if !self.locked.contains(&node) {
            // The guard is reconstructed as a force_unlock in drop.
            unsafe { mem::forget((*node).lock.lock()) };
            self.locked.push(node);
        }
    }
}

impl Drop for NodeLocker {
    fn drop(&mut self) {
        for &node in self.locked.iter().rev() {
            // Safety: each entry was locked by this locker and never freed
            // while locked (the holder keeps it linked or owns it).
            unsafe { (*node).lock.force_unlock() };
        }
    }
}

/// An optimistic range lock: lazy skip list with per-node mutexes,
/// `fully_linked` / `marked` flags and validation after locking.
///
/// Generic over the memory reclamation strategy `G` (walks are unlocked, so
/// unlinked nodes must outlive concurrent traversals).
///
pub struct OptimisticRangeLock<G: Guard> {
    head: NodePtr,
    tail: NodePtr,
    elements: AtomicUsize,
    guard: G,
}

impl<G: Guard> OptimisticRangeLock<G> {
    pub fn new() -> Self {
        let head = LazyNode::alloc(
            Interval {
                start: u64::MIN,
                end: u64::MIN,
            },
            MAX_LEVEL,
        );
        let tail = LazyNode::alloc(
            Interval {
                start: u64::MAX,
                end: u64::MAX,
            },
            MAX_LEVEL,
        );

        unsafe {
            for level in 0..=MAX_LEVEL {
                (*head).set_forward(level, tail);
            }
        }

        OptimisticRangeLock {
            head,
            tail,
            elements: AtomicUsize::new(0),
            guard: G::default(),
        }
    }

    /// Unlocked walk recording the candidate's window at every level.
    /// Returns the highest level at which an overlapping node was observed,
    /// or -1.
    fn find_insert(
        &self,
        start: u64,
        end: u64,
        preds: &mut [NodePtr; LEVELS],
        succs: &mut [NodePtr; LEVELS],
    ) -> isize {
        let mut level_found: isize = -1;
        let mut pred = self.head;

        for level in (0..LEVELS).rev() {
            unsafe {
                let mut curr = (*pred).forward(level);
                while start >= (*curr).interval.end {
                    pred = curr;
                    curr = (*pred).forward(level);
                }
                if level_found == -1 && (*curr).interval.start < end {
                    level_found = level as isize;
                }
                preds[level] = pred;
                succs[level] = curr;
            }
        }

        level_found
    }

    /// Unlocked walk looking for the exact interval. Returns the highest
    /// level at which it was observed, or -1.
    fn find_exact(
        &self,
        start: u64,
        end: u64,
        preds: &mut [NodePtr; LEVELS],
        succs: &mut [NodePtr; LEVELS],
    ) -> isize {
        let mut level_found: isize = -1;
        let mut pred = self.head;

        for level in (0..LEVELS).rev() {
            unsafe {
                let mut curr = (*pred).forward(level);
                while start >= (*curr).interval.end {
                    pred = curr;
                    curr = (*pred).forward(level);
                }
                if level_found == -1
                    && start == (*curr).interval.start
                    && end == (*curr).interval.end
                {
                    level_found = level as isize;
                }
                preds[level] = pred;
                succs[level] = curr;
            }
        }

        level_found
    }

    /// Debugging probe: is the exact interval currently held (fully linked
    /// and not marked)?
    pub fn search_lock(&self, start: u64, end: u64) -> bool {
        let _pin = G::pin();
        let mut preds = [ptr::null_mut(); LEVELS];
        let mut succs = [ptr::null_mut(); LEVELS];

        let level_found = self.find_exact(start, end, &mut preds, &mut succs);
        if level_found < 0 {
            return false;
        }
        let found = succs[level_found as usize];
        unsafe {
            (*found).fully_linked.load(Ordering::Acquire) && !(*found).marked.load(Ordering::Acquire)
        }
    }
}

impl<G: Guard> RangeLock for OptimisticRangeLock<G> {
    fn try_lock(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let _pin = G::pin();

        let top_level = random_level(MAX_LEVEL);
        let mut preds = [ptr::null_mut(); LEVELS];
        let mut succs = [ptr::null_mut(); LEVELS];

        loop {
            let level_found = self.find_insert(start, end, &mut preds, &mut succs);
            if level_found >= 0 {
                let found = succs[level_found as usize];
                if !unsafe { (*found).marked.load(Ordering::Acquire) } {
                    return false;
                }
                // The overlapping node is being torn down; wait for the
                // unlink to finish and look again.
                std::hint::spin_loop();
                continue;
            }

            let mut valid = true;
            let mut locker = NodeLocker::new();
            for level in 0..=top_level {
                let pred = preds[level];
                let succ = succs[level];

                unsafe {
                    locker.lock(pred);
                    valid = !(*pred).marked.load(Ordering::Acquire)
                        && !(*succ).marked.load(Ordering::Acquire)
                        && (*pred).forward(level) == succ;
                }
                if !valid {
                    break;
                }
            }

            if !valid {
                continue;
            }

            let node = LazyNode::alloc(Interval { start, end }, top_level);
            unsafe {
                for level in 0..=top_level {
                    (*node).set_forward(level, succs[level]);
                    (*preds[level]).set_forward(level, node);
                }
                (*node).fully_linked.store(true, Ordering::Release);
            }

            self.elements.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    fn release_lock(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let _pin = G::pin();

        let mut preds = [ptr::null_mut(); LEVELS];
        let mut succs = [ptr::null_mut(); LEVELS];

        let mut victim: NodePtr = ptr::null_mut();
        let mut is_marked = false;
        let mut top_level = 0;

        loop {
            let mut locker = NodeLocker::new();

            let level_found = self.find_exact(start, end, &mut preds, &mut succs);
            if level_found >= 0 {
                victim = succs[level_found as usize];
            } else if !is_marked {
                warn!(start, end, "released range is not held");
                return false;
            }

            if !is_marked {
                // The victim must be fully linked (observed at its own top
                // level) and not already released.
                let ready = level_found >= 0
                    && unsafe { (*victim).top_level } == level_found as usize
                    && !unsafe { (*victim).marked.load(Ordering::Acquire) };
                if !ready {
                    warn!(start, end, "range released twice");
                    return false;
                }

                top_level = unsafe { (*victim).top_level };
                unsafe { locker.lock(victim) };
                if unsafe { (*victim).marked.load(Ordering::Acquire) } {
                    warn!(start, end, "range released twice");
                    return false;
                }
                unsafe { (*victim).marked.store(true, Ordering::Release) };
                is_marked = true;
            }

            let mut valid = true;
            for level in 0..=top_level {
                let pred = preds[level];
                unsafe {
                    locker.lock(pred);
                    valid = !(*pred).marked.load(Ordering::Acquire)
                        && (*pred).forward(level) == victim;
                }
                if !valid {
                    break;
                }
            }
            if !valid {
                continue;
            }

            unsafe {
                for level in (0..=top_level).rev() {
                    (*preds[level]).set_forward(level, (*victim).forward(level));
                }
            }

            self.elements.fetch_sub(1, Ordering::Relaxed);
            // Safety: the victim is unlinked at every level; unlocked walks
            // may still hold it, so reclamation goes through the guard.
            unsafe { self.guard.defer_destroy(victim, LazyNode::dealloc_node) };
            return true;
        }
    }

    fn len(&self) -> usize {
        self.elements.load(Ordering::Relaxed)
    }
}

impl<G: Guard> Default for OptimisticRangeLock<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Guard> Drop for OptimisticRangeLock<G> {
    fn drop(&mut self) {
        unsafe {
            let mut curr = self.head;
            while !curr.is_null() {
                let next = if curr == self.tail {
                    ptr::null_mut()
                } else {
                    (*curr).forward(0)
                };
                LazyNode::dealloc_node(curr);
                curr = next;
            }
        }
    }
}

// Safety: nodes hold plain u64 bounds; mutation happens under per-node
// mutexes with validation, and the guard bounds reclamation.
unsafe impl<G: Guard> Send for OptimisticRangeLock<G> {}
unsafe impl<G: Guard> Sync for OptimisticRangeLock<G> {}

impl<G: Guard> fmt::Display for OptimisticRangeLock<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _pin = G::pin();
        writeln!(f, "optimistic range lock, {} ranges", self.len())?;
        if self.len() == 0 {
            return writeln!(f, "list is empty");
        }
        unsafe {
            for level in (0..LEVELS).rev() {
                write!(f, "level {level:2}: head")?;
                let mut curr = (*self.head).forward(0);
                while curr != self.tail {
                    if (*curr).top_level >= level {
                        write!(f, " ->{}", (*curr).interval)?;
                    } else {
                        write!(f, " ---------")?;
                    }
                    curr = (*curr).forward(0);
                }
                writeln!(f, " -> tail")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::DeferredGuard;
    use std::sync::Arc;
    use std::thread;

    type TestLock = OptimisticRangeLock<DeferredGuard>;

    #[test]
    fn test_insert_release_cycle() {
        let lock = TestLock::new();
        assert!(lock.try_lock(10, 20));
        assert!(!lock.try_lock(15, 25));
        assert!(lock.release_lock(10, 20));
        assert!(lock.try_lock(15, 25));
        assert!(lock.release_lock(15, 25));
        assert_eq!(lock.len(), 0);
    }

    #[test]
    fn test_search_lock_probe() {
        let lock = TestLock::new();
        assert!(!lock.search_lock(10, 20));
        lock.try_lock(10, 20);
        assert!(lock.search_lock(10, 20));
        // Exact match only.
        assert!(!lock.search_lock(10, 21));
        lock.release_lock(10, 20);
        assert!(!lock.search_lock(10, 20));
    }

    #[test]
    fn test_release_validates_exact_bounds() {
        let lock = TestLock::new();
        lock.try_lock(100, 200);
        assert!(!lock.release_lock(100, 150));
        assert!(!lock.release_lock(50, 200));
        assert!(lock.release_lock(100, 200));
    }

    #[test]
    fn test_concurrent_disjoint_churn() {
        let lock = Arc::new(TestLock::new());
        let threads = 8;
        let per_thread = 400u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let base = 1 + t as u64 * per_thread * 10;
                    for round in 0..3 {
                        for i in 0..per_thread {
                            assert!(
                                lock.try_lock(base + i * 10, base + i * 10 + 9),
                                "round {round}: acquire failed"
                            );
                        }
                        for i in 0..per_thread {
                            assert!(lock.release_lock(base + i * 10, base + i * 10 + 9));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.len(), 0);
    }

    #[test]
    fn test_contended_same_range() {
        let lock = Arc::new(TestLock::new());
        let threads = 8;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let mut acquired = 0;
                    while acquired < 50 {
                        if lock.try_lock(10, 20) {
                            acquired += 1;
                            assert!(lock.release_lock(10, 20));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.len(), 0);
    }
}
