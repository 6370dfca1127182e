use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::guard::Guard;
use crate::internal::{AtomicMarkedRef, random_level};
use crate::interval::Interval;
use crate::range_lock::RangeLock;

const MAX_LEVEL: usize = 10;
const LEVELS: usize = MAX_LEVEL + 1;

type NodePtr = *mut SkipNode;

// =============================================================================
// LOCK-FREE RANGE LOCK (Harris-Michael skip list over intervals)
// =============================================================================
//
// A set of non-overlapping half-open intervals ordered by start. Acquiring a
// range inserts an interval node; releasing removes it. Nothing blocks: every
// operation is a sequence of CAS attempts, and every failed CAS corresponds
// to another thread's successful one.
//
// Level 2:  HEAD ────────────────────► [30,40) ───────────────────────► TAIL
//             │                           │
// Level 1:  HEAD ──────► [10,20) ─────► [30,40) ───────────────────────► TAIL
//             │             │             │
// Level 0:  HEAD ──────► [10,20) ─────► [30,40) ──────► [40,55) ──────► TAIL
//
// Marked reference: the low bit of node.next[level] says the NODE is
// logically deleted at that level. Release marks top-down; the level-0 mark
// is the ownership CAS and the linearisation point of release.
//
// INVARIANTS:
// 1. Live intervals never overlap; the chain is strictly increasing in start
//    at every level (which also sorts the ends).
// 2. A node at level k > 0 is also linked at level k - 1 once insertion
//    completes; level 0 is the source of truth.
// 3. A set mark is never cleared. Helpers may only advance the reference
//    part of a predecessor's pointer to snip a marked node out.
// 4. HEAD [MIN, MIN) and TAIL [MAX, MAX) are never marked or removed.
// 5. Only the thread that marks level 0 owns the node; it must confirm the
//    node is unlinked at every level before retiring it through the guard.
//
// Insert publishes bottom-up: the level-0 CAS makes the interval visible
// (linearisation point of try_lock); upper-level links are search
// accelerators and may lag. The overlap decision reads only the level-0
// neighbours: since live intervals are disjoint and start-sorted, the
// immediate predecessor carries the largest end among all predecessors, so
//
//     overlap  ⇔  pred.end > start  ∨  curr.start < end
//
// =============================================================================

/// A skip-list node carrying one locked interval.
///
/// Uses the flexible array member pattern: the tower of marked forward
/// references is allocated inline after the struct fields, one entry per
/// level in `0..=top_level`. Single allocation per node.
///
#[repr(C)]
struct SkipNode {
    interval: Interval,
    top_level: usize,
    // Flexible array: tower entries live inline after this struct.
    // Layout: [next[0], next[1], ..., next[top_level]]
    tower: [AtomicMarkedRef<SkipNode>; 0],
}

impl SkipNode {
    fn layout(top_level: usize) -> Layout {
        Layout::new::<Self>()
            .extend(Layout::array::<AtomicMarkedRef<SkipNode>>(top_level + 1).unwrap())
            .unwrap()
            .0
            .pad_to_align()
    }

    /// Allocate a node with all tower entries null and unmarked.
    fn alloc(interval: Interval, top_level: usize) -> NodePtr {
        unsafe {
            let layout = Self::layout(top_level);
            let node = alloc(layout) as NodePtr;
            if node.is_null() {
                handle_alloc_error(layout);
            }

            ptr::write(&mut (*node).interval, interval);
            ptr::write(&mut (*node).top_level, top_level);

            let tower = (*node).tower.as_ptr() as *mut AtomicMarkedRef<SkipNode>;
            for level in 0..=top_level {
                ptr::write(tower.add(level), AtomicMarkedRef::null());
            }

            node
        }
    }

    /// Deallocate a node.
    ///
    /// # Safety
    /// The pointer must have been produced by `alloc` and not freed before.
    unsafe fn dealloc_node(node: NodePtr) {
        unsafe {
            let layout = Self::layout((*node).top_level);
            dealloc(node as *mut u8, layout);
        }
    }

    /// Tower entry for `level`.
    ///
    /// # Safety
    /// `level <= self.top_level`.
    #[inline]
    unsafe fn next(&self, level: usize) -> &AtomicMarkedRef<SkipNode> {
        debug_assert!(level <= self.top_level);
        unsafe { &*self.tower.as_ptr().add(level) }
    }
}

/// A lock-free range lock: Harris-Michael skip list keyed by interval start,
/// with logical deletion via per-level mark bits and opportunistic physical
/// unlinking by every traversal.
///
/// Generic over the memory reclamation strategy `G`.
///
pub struct LockFreeRangeLock<G: Guard> {
    head: NodePtr,
    tail: NodePtr,
    elements: AtomicUsize,
    guard: G,
}

impl<G: Guard> LockFreeRangeLock<G> {
    pub fn new() -> Self {
        let tail = SkipNode::alloc(
            Interval {
                start: u64::MAX,
                end: u64::MAX,
            },
            MAX_LEVEL,
        );
        let head = SkipNode::alloc(
            Interval {
                start: u64::MIN,
                end: u64::MIN,
            },
            MAX_LEVEL,
        );

        unsafe {
            for level in 0..=MAX_LEVEL {
                (*head).next(level).store(tail, false);
            }
        }

        LockFreeRangeLock {
            head,
            tail,
            elements: AtomicUsize::new(0),
            guard: G::default(),
        }
    }

    /// Descend recording the insertion window for `[start, end)` at every
    /// level, snipping marked nodes out of the walked path (restarting the
    /// whole traversal when a snip CAS loses).
    ///
    /// Returns true iff the candidate overlaps a live interval, judged from
    /// the level-0 neighbours.
    ///
    fn find_insert(
        &self,
        start: u64,
        end: u64,
        preds: &mut [NodePtr; LEVELS],
        succs: &mut [NodePtr; LEVELS],
    ) -> bool {
        'retry: loop {
            let mut pred = self.head;
            for level in (0..LEVELS).rev() {
                unsafe {
                    let mut curr = (*pred).next(level).get_reference();
                    loop {
                        let (mut succ, mut marked) = (*curr).next(level).get();
                        while marked {
                            if !(*pred).next(level).compare_and_set(curr, succ, false, false) {
                                continue 'retry;
                            }
                            curr = (*pred).next(level).get_reference();
                            (succ, marked) = (*curr).next(level).get();
                        }
                        if (*curr).interval.start < start {
                            pred = curr;
                            curr = succ;
                        } else {
                            break;
                        }
                    }
                    preds[level] = pred;
                    succs[level] = curr;
                }
            }
            unsafe {
                let pred = &(*preds[0]).interval;
                let curr = &(*succs[0]).interval;
                return pred.end > start || curr.start < end;
            }
        }
    }

    /// Descend to the exact node `[start, end)`, snipping marked nodes in
    /// the walked prefix. Returns true iff the level-0 successor matches
    /// exactly.
    ///
    fn find_exact(
        &self,
        start: u64,
        end: u64,
        preds: &mut [NodePtr; LEVELS],
        succs: &mut [NodePtr; LEVELS],
    ) -> bool {
        'retry: loop {
            let mut pred = self.head;
            for level in (0..LEVELS).rev() {
                unsafe {
                    let mut curr = (*pred).next(level).get_reference();
                    loop {
                        if (*curr).interval.start > start {
                            break;
                        }
                        let (mut succ, mut marked) = (*curr).next(level).get();
                        while marked {
                            if !(*pred).next(level).compare_and_set(curr, succ, false, false) {
                                continue 'retry;
                            }
                            curr = (*pred).next(level).get_reference();
                            (succ, marked) = (*curr).next(level).get();
                        }
                        if (*curr).interval.end <= start {
                            pred = curr;
                            curr = succ;
                        } else {
                            break;
                        }
                    }
                    preds[level] = pred;
                    succs[level] = curr;
                }
            }
            unsafe {
                let found = &(*succs[0]).interval;
                return found.start == start && found.end == end;
            }
        }
    }

    /// Physically unlink a logically deleted node at every level it occupies,
    /// top-down. Called by the releasing thread after it wins the level-0
    /// mark.
    ///
    /// Each level loops until the victim is confirmed out of that level's
    /// chain. A one-shot helping pass is not enough: a concurrent insert may
    /// splice an equal-start node in front of the victim, hiding it from a
    /// key-based walk while it is still reachable. Retirement requires the
    /// stronger guarantee, so the victim is located by identity.
    ///
    fn find_delete(&self, victim: NodePtr) {
        let start = unsafe { (*victim).interval.start };
        let top_level = unsafe { (*victim).top_level };

        for level in (0..=top_level).rev() {
            'retry: loop {
                let mut pred = self.head;
                loop {
                    let curr = unsafe { (*pred).next(level).get_reference() };
                    if curr == victim {
                        let (succ, _) = unsafe { (*victim).next(level).get() };
                        if unsafe { (*pred).next(level).compare_and_set(victim, succ, false, false) }
                        {
                            break 'retry;
                        }
                        // pred was marked or advanced underneath us.
                        continue 'retry;
                    }
                    unsafe {
                        if (*curr).interval.start > start {
                            // Walked past the victim's slot: already unlinked here.
                            break 'retry;
                        }
                        let (succ, marked) = (*curr).next(level).get();
                        if marked {
                            if !(*pred).next(level).compare_and_set(curr, succ, false, false) {
                                continue 'retry;
                            }
                            continue;
                        }
                        pred = curr;
                    }
                }
            }
        }
    }
}

impl<G: Guard> RangeLock for LockFreeRangeLock<G> {
    fn try_lock(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let _pin = G::pin();

        let top_level = random_level(MAX_LEVEL);
        let mut preds = [ptr::null_mut(); LEVELS];
        let mut succs = [ptr::null_mut(); LEVELS];

        loop {
            if self.find_insert(start, end, &mut preds, &mut succs) {
                return false;
            }

            let node = SkipNode::alloc(Interval { start, end }, top_level);

            unsafe {
                for level in 0..=top_level {
                    (*node).next(level).store(succs[level], false);
                }

                if !(*preds[0]).next(0).compare_and_set(succs[0], node, false, false) {
                    // Never published: this thread still owns the allocation.
                    SkipNode::dealloc_node(node);
                    continue;
                }

                // Linearised. Link the remaining levels; these only
                // accelerate searches and may be abandoned if a release
                // already started tearing the node down.
                'link: for level in 1..=top_level {
                    loop {
                        // Keep the tower entry pointing at the successor
                        // recorded for this level. A mark set by a concurrent
                        // release makes the CAS fail; the remaining levels
                        // then stay unlinked.
                        let (tower_succ, tower_marked) = (*node).next(level).get();
                        if tower_marked {
                            break 'link;
                        }
                        if tower_succ != succs[level]
                            && !(*node)
                                .next(level)
                                .compare_and_set(tower_succ, succs[level], false, false)
                        {
                            break 'link;
                        }

                        if (*preds[level])
                            .next(level)
                            .compare_and_set(succs[level], node, false, false)
                        {
                            break;
                        }

                        // Refresh the window (and help unlink along the way).
                        self.find_insert(start, end, &mut preds, &mut succs);
                    }
                }
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

        if !self.find_exact(start, end, &mut preds, &mut succs) {
            warn!(start, end, "released range is not held");
            return false;
        }

        let victim = succs[0];
        unsafe {
            // Mark the upper levels top-down. Any thread may help here;
            // these marks only stop traversals from using the node as a
            // shortcut.
            for level in (1..=(*victim).top_level).rev() {
                let (mut succ, mut marked) = (*victim).next(level).get();
                while !marked {
                    (*victim).next(level).attempt_mark(succ, true);
                    (succ, marked) = (*victim).next(level).get();
                }
            }

            // The level-0 mark decides ownership: exactly one releaser wins.
            let (mut succ, _) = (*victim).next(0).get();
            loop {
                let won = (*victim).next(0).compare_and_set(succ, succ, false, true);
                let (succ_now, marked) = (*victim).next(0).get();
                succ = succ_now;
                if won {
                    self.find_delete(victim);
                    self.elements.fetch_sub(1, Ordering::Relaxed);
                    // Safety: the victim is unlinked at every level and this
                    // thread won the ownership CAS, so it is retired once.
                    self.guard.defer_destroy(victim, SkipNode::dealloc_node);
                    return true;
                } else if marked {
                    warn!(start, end, "range released twice");
                    return false;
                }
                // The successor moved (a neighbour was snipped or inserted);
                // retry with the fresh value.
            }
        }
    }

    fn len(&self) -> usize {
        self.elements.load(Ordering::Relaxed)
    }
}

impl<G: Guard> Default for LockFreeRangeLock<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Guard> Drop for LockFreeRangeLock<G> {
    fn drop(&mut self) {
        // Exclusive access: walk level 0 and free everything still linked.
        // Retired nodes are unreachable from head and belong to the guard.
        unsafe {
            let mut curr = self.head;
            while !curr.is_null() {
                let next = (*curr).next(0).get_reference();
                SkipNode::dealloc_node(curr);
                curr = next;
            }
        }
    }
}

// Safety: nodes hold plain u64 bounds and all shared mutation goes through
// atomic CAS; the guard bounds reclamation.
unsafe impl<G: Guard> Send for LockFreeRangeLock<G> {}
unsafe impl<G: Guard> Sync for LockFreeRangeLock<G> {}

impl<G: Guard> fmt::Display for LockFreeRangeLock<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _pin = G::pin();
        writeln!(f, "lock-free range lock, {} ranges", self.len())?;
        if self.len() == 0 {
            return writeln!(f, "list is empty");
        }
        unsafe {
            for level in (0..LEVELS).rev() {
                write!(f, "level {level:2}: head")?;
                let mut curr = (*self.head).next(0).get_reference();
                while curr != self.tail {
                    if (*curr).top_level >= level {
                        write!(f, " ->{}", (*curr).interval)?;
                    } else {
                        write!(f, " ---------")?;
                    }
                    curr = (*curr).next(0).get_reference();
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

    type TestLock = LockFreeRangeLock<DeferredGuard>;

    #[test]
    fn test_insert_release_cycle() {
        let lock = TestLock::new();
        assert!(lock.try_lock(10, 20));
        assert_eq!(lock.len(), 1);
        assert!(lock.release_lock(10, 20));
        assert_eq!(lock.len(), 0);
        assert!(lock.try_lock(10, 20));
    }

    #[test]
    fn test_overlap_checks_predecessor_end() {
        let lock = TestLock::new();
        // A long range whose end extends far past its start.
        assert!(lock.try_lock(10, 1000));
        // Candidate starting inside it but after its start must be refused.
        assert!(!lock.try_lock(500, 600));
        assert!(!lock.try_lock(999, 2000));
        // Touching at the end is fine.
        assert!(lock.try_lock(1000, 1100));
    }

    #[test]
    fn test_release_unlinks_at_all_levels() {
        let lock = TestLock::new();
        // Enough inserts that some nodes get tall towers.
        for k in 0..512u64 {
            assert!(lock.try_lock(k * 10 + 1, k * 10 + 5));
        }
        for k in 0..512u64 {
            assert!(lock.release_lock(k * 10 + 1, k * 10 + 5));
        }
        assert_eq!(lock.len(), 0);
        // The full domain is free again.
        assert!(lock.try_lock(1, 5121));
    }

    #[test]
    fn test_equal_start_after_release() {
        let lock = TestLock::new();
        for _ in 0..100 {
            assert!(lock.try_lock(40, 60));
            assert!(!lock.try_lock(40, 50));
            assert!(lock.release_lock(40, 60));
        }
        assert_eq!(lock.len(), 0);
    }

    #[test]
    fn test_concurrent_disjoint_inserts_help_each_other() {
        let lock = Arc::new(TestLock::new());
        let threads = 8;
        let per_thread = 500u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    let base = 1 + t as u64 * per_thread * 10;
                    for i in 0..per_thread {
                        assert!(lock.try_lock(base + i * 10, base + i * 10 + 8));
                    }
                    for i in 0..per_thread {
                        assert!(lock.release_lock(base + i * 10, base + i * 10 + 8));
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
    fn test_display_lists_levels() {
        let lock = TestLock::new();
        lock.try_lock(1, 9);
        let dump = lock.to_string();
        assert!(dump.contains("level  0: head"));
        assert!(dump.contains("[1, 9)"));
    }
}
