use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::guard::Guard;
use crate::internal::AtomicMarkedRef;
use crate::interval::Interval;
use crate::range_lock::RangeLock;

type NodePtr = *mut ListNode;

// =============================================================================
// SORTED-LIST RANGE LOCK (single-level Harris list over intervals)
// =============================================================================
//
// One chain sorted by interval position; the mark bit on node.next says the
// NODE ITSELF is logically deleted.
//
// ┌──────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐
// │ HEAD │───►│ [10,20) │───►│ [30,40) │───►│ [40,55) │───► NULL
// │(sent)│    └─────────┘    └─────────┘    └─────────┘
// └──────┘
//
// Ordering is by disjointness, not key equality: a candidate either lies
// entirely before a node (splice in front of it), entirely after (advance),
// or overlaps (acquire fails). End of list counts as "after everything".
//
// Release marks the victim's next pointer (the linearisation point; losing
// that CAS to an already-set mark is the concurrent-release misuse case),
// then loops until the node is confirmed physically unlinked before retiring
// it through the guard. Traversals still help by snipping any marked node
// they pass.
//
// =============================================================================

struct ListNode {
    data: Option<Interval>,
    next: AtomicMarkedRef<ListNode>,
}

impl ListNode {
    fn new(interval: Interval) -> Self {
        ListNode {
            data: Some(interval),
            next: AtomicMarkedRef::null(),
        }
    }

    fn new_sentinel() -> Self {
        ListNode {
            data: None,
            next: AtomicMarkedRef::null(),
        }
    }

    #[inline]
    fn interval(&self) -> &Interval {
        self.data
            .as_ref()
            .expect("sentinel node carries no interval")
    }

    /// # Safety
    /// The pointer must have been produced by `Box::into_raw` and not freed
    /// before.
    unsafe fn dealloc_node(node: NodePtr) {
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// A lock-free range lock over a single-level sorted linked list, with
/// overlap comparison in place of key equality.
///
/// Generic over the memory reclamation strategy `G`.
///
pub struct SortedListRangeLock<G: Guard> {
    head: NodePtr,
    elements: AtomicUsize,
    guard: G,
}

impl<G: Guard> SortedListRangeLock<G> {
    pub fn new() -> Self {
        SortedListRangeLock {
            head: Box::into_raw(Box::new(ListNode::new_sentinel())),
            elements: AtomicUsize::new(0),
            guard: G::default(),
        }
    }

    /// Traverse and splice `node` in, helping unlink marked nodes on the
    /// way. Returns false (without linking) if `interval` overlaps a live
    /// node.
    ///
    /// # Safety
    /// `node` must be a fresh allocation carrying `interval`, owned by the
    /// caller until this returns true.
    unsafe fn insert_node(&self, node: NodePtr, interval: Interval) -> bool {
        'restart: loop {
            let mut pred = self.head;
            loop {
                let (curr, pred_marked) = unsafe { (*pred).next.get() };
                if pred_marked {
                    // pred was logically deleted underneath us.
                    continue 'restart;
                }

                if curr.is_null() {
                    // End of list: the candidate goes last.
                    unsafe { (*node).next.store(ptr::null_mut(), false) };
                    if unsafe { (*pred).next.compare_and_set(curr, node, false, false) } {
                        return true;
                    }
                    continue;
                }

                let (curr_next, curr_marked) = unsafe { (*curr).next.get() };
                if curr_marked {
                    // curr is logically deleted: snip it and re-read.
                    unsafe {
                        (*pred).next.compare_and_set(curr, curr_next, false, false);
                    }
                    continue;
                }

                let curr_interval = unsafe { *(*curr).interval() };
                if curr_interval.precedes(&interval) {
                    pred = curr;
                } else if interval.overlaps(&curr_interval) {
                    return false;
                } else {
                    // The candidate lies entirely before curr.
                    unsafe { (*node).next.store(curr, false) };
                    if unsafe { (*pred).next.compare_and_set(curr, node, false, false) } {
                        return true;
                    }
                    // Lost the splice; re-read pred's successor.
                }
            }
        }
    }

    /// Loop until `node` (already marked) is confirmed out of the chain.
    /// Required before retiring: a node freed while still linked would be
    /// dereferenced by later traversals.
    ///
    /// # Safety
    /// `node` must be marked and reachable only through this list.
    unsafe fn unlink_marked(&self, node: NodePtr) {
        let start = unsafe { (*node).interval().start };

        'retry: loop {
            let mut pred = self.head;
            loop {
                let (curr, pred_marked) = unsafe { (*pred).next.get() };
                if pred_marked {
                    continue 'retry;
                }
                if curr.is_null() {
                    // Reached the end without meeting it: already unlinked.
                    return;
                }
                if curr == node {
                    let (succ, _) = unsafe { (*node).next.get() };
                    if unsafe { (*pred).next.compare_and_set(node, succ, false, false) } {
                        return;
                    }
                    continue 'retry;
                }

                let (curr_next, curr_marked) = unsafe { (*curr).next.get() };
                if curr_marked {
                    if !unsafe { (*pred).next.compare_and_set(curr, curr_next, false, false) } {
                        continue 'retry;
                    }
                    continue;
                }
                if unsafe { (*curr).interval().start } > start {
                    // Walked past its position: already unlinked.
                    return;
                }
                pred = curr;
            }
        }
    }
}

impl<G: Guard> RangeLock for SortedListRangeLock<G> {
    fn try_lock(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let _pin = G::pin();

        let interval = Interval { start, end };
        let node = Box::into_raw(Box::new(ListNode::new(interval)));

        if unsafe { self.insert_node(node, interval) } {
            self.elements.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            // Never published: this thread still owns the allocation.
            unsafe { ListNode::dealloc_node(node) };
            false
        }
    }

    fn release_lock(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        let _pin = G::pin();

        let target = Interval { start, end };
        'restart: loop {
            let mut pred = self.head;
            loop {
                let (curr, pred_marked) = unsafe { (*pred).next.get() };
                if pred_marked {
                    continue 'restart;
                }
                if curr.is_null() {
                    warn!(start, end, "released range is not held");
                    return false;
                }

                let (curr_next, curr_marked) = unsafe { (*curr).next.get() };
                if curr_marked {
                    unsafe {
                        (*pred).next.compare_and_set(curr, curr_next, false, false);
                    }
                    continue;
                }

                let curr_interval = unsafe { *(*curr).interval() };
                if curr_interval.precedes(&target) {
                    pred = curr;
                    continue;
                }
                if curr_interval == target {
                    // Logical deletion: tag the victim's own next pointer.
                    loop {
                        let (succ, marked) = unsafe { (*curr).next.get() };
                        if marked {
                            warn!(start, end, "range released twice");
                            return false;
                        }
                        if unsafe { (*curr).next.compare_and_set(succ, succ, false, true) } {
                            break;
                        }
                    }
                    unsafe {
                        self.unlink_marked(curr);
                        self.elements.fetch_sub(1, Ordering::Relaxed);
                        // Safety: confirmed unlinked, and this thread won the
                        // mark, so it is retired once.
                        self.guard.defer_destroy(curr, ListNode::dealloc_node);
                    }
                    return true;
                }

                // Walked past the target's position without a match.
                warn!(start, end, "released range is not held");
                return false;
            }
        }
    }

    fn len(&self) -> usize {
        self.elements.load(Ordering::Relaxed)
    }
}

impl<G: Guard> Default for SortedListRangeLock<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Guard> Drop for SortedListRangeLock<G> {
    fn drop(&mut self) {
        unsafe {
            let mut curr = self.head;
            while !curr.is_null() {
                let next = (*curr).next.get_reference();
                ListNode::dealloc_node(curr);
                curr = next;
            }
        }
    }
}

// Safety: nodes hold plain u64 bounds and all shared mutation goes through
// atomic CAS; the guard bounds reclamation.
unsafe impl<G: Guard> Send for SortedListRangeLock<G> {}
unsafe impl<G: Guard> Sync for SortedListRangeLock<G> {}

impl<G: Guard> fmt::Display for SortedListRangeLock<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _pin = G::pin();
        write!(f, "sorted-list range lock: head")?;
        unsafe {
            let mut curr = (*self.head).next.get_reference();
            while !curr.is_null() {
                let (next, marked) = (*curr).next.get();
                if marked {
                    write!(f, " ->[x]")?;
                } else {
                    write!(f, " ->{}", (*curr).interval())?;
                }
                curr = next;
            }
        }
        writeln!(f)
    }
}
