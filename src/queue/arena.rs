//! # Node arena
//!
//! Queue nodes are addressed by index instead of by pointer. Storage grows in segments:
//! the first one has 64 slots, every next one twice as many, so an index maps to
//! `(segment, offset)` with a bit of arithmetic and no segment ever moves.
//!
//! A missing segment is allocated by whoever needs it first and installed with a CAS,
//! the loser of the race frees its copy. No lock involved.
//!
//! Slots come back through [NodeArena::recycle], which the queue only calls once nobody can
//! observe the node anymore: it's deferred through the epoch for displaced heads and for
//! cancelled nodes alike.

use std::{
    ptr,
    sync::atomic::{
        AtomicPtr, AtomicU32,
        Ordering::{AcqRel, Acquire, Relaxed},
    },
};

use crossbeam::{epoch::Guard, queue::SegQueue};

use super::node::{Node, NodeId};
use crate::thread::ThreadHandle;

const FIRST_SEGMENT_BITS: u32 = 6;
/// enough segments to cover every index below `NodeId::NIL`
const SEGMENTS: usize = 27;

fn locate(index: u32) -> (usize, usize) {
    let biased = u64::from(index) + (1 << FIRST_SEGMENT_BITS);
    let segment = 63 - biased.leading_zeros() - FIRST_SEGMENT_BITS;
    let offset = biased - (1 << (segment + FIRST_SEGMENT_BITS));
    (segment as usize, offset as usize)
}

fn segment_len(segment: usize) -> usize {
    1 << (segment + FIRST_SEGMENT_BITS as usize)
}

pub(crate) struct NodeArena {
    segments: [AtomicPtr<Node>; SEGMENTS],
    /// first index never handed out
    high_water: AtomicU32,
    /// indexes only, the generation is read back from the slot
    free: SegQueue<u32>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            high_water: AtomicU32::new(0),
            free: SegQueue::new(),
        }
    }

    /// Hand out a blank node owned by `waiter`, or a sentinel for `None`.
    ///
    /// The node is private to the caller until it's linked into the queue.
    pub(crate) fn allocate(&self, waiter: Option<ThreadHandle>, guard: &Guard) -> NodeId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.fresh(),
        };
        let node = self.slot(index);
        // a fresh slot was never published, a recycled one was unreachable before it got freed
        node.reset(waiter, guard);
        NodeId::new(index, node.generation())
    }

    fn fresh(&self) -> u32 {
        let index = self.high_water.fetch_add(1, Relaxed);
        assert!(index < NodeId::NIL, "node arena exhausted");
        let (segment, _) = locate(index);
        self.ensure_segment(segment);
        index
    }

    fn ensure_segment(&self, segment: usize) {
        let slot = &self.segments[segment];
        if !slot.load(Acquire).is_null() {
            return;
        }
        let nodes: Box<[Node]> = (0..segment_len(segment)).map(|_| Node::default()).collect();
        let fresh = Box::into_raw(nodes).cast::<Node>();
        if slot
            .compare_exchange(ptr::null_mut(), fresh, AcqRel, Acquire)
            .is_err()
        {
            // another thread installed it first
            // SAFETY: `fresh` came from the box above and was never shared
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, segment_len(segment)))
            });
        }
    }

    /// The slot of `id`, whichever generation it's at now.
    pub(crate) fn get(&self, id: NodeId) -> &Node {
        self.slot(id.index())
    }

    fn slot(&self, index: u32) -> &Node {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Acquire);
        assert!(!base.is_null(), "node {index} points into a missing segment");
        // SAFETY: the segment outlives `self` and `offset` is within its length
        unsafe { &*base.add(offset) }
    }

    /// Return a slot for reuse.
    ///
    /// The caller guarantees no thread can reach `id` anymore, not even one pinned earlier.
    pub(crate) fn recycle(&self, id: NodeId) {
        self.free.push(id.index());
    }

    #[cfg(test)]
    pub(crate) fn allocated(&self) -> u32 {
        self.high_water.load(Relaxed)
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if !base.is_null() {
                // SAFETY: installed by `ensure_segment` from a box of exactly this length
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(base, segment_len(segment)))
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, thread::scope};

    use crossbeam::epoch;

    use super::*;

    #[test]
    fn index_math_covers_segments_back_to_back() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
        let (last, offset) = locate(NodeId::NIL - 1);
        assert!(last < SEGMENTS);
        assert!(offset < segment_len(last));
    }

    #[test]
    fn recycled_slots_are_reused() {
        let guard = epoch::pin();
        let arena = NodeArena::new();
        let a = arena.allocate(None, &guard);
        let b = arena.allocate(Some(ThreadHandle::current()), &guard);
        assert_ne!(a, b);
        assert!(arena.get(b).waiter(&guard).is_some());

        arena.get(b).bump_generation();
        arena.recycle(b);
        let c = arena.allocate(None, &guard);
        assert_eq!(c.index(), b.index());
        // the old id doesn't name the new occupant
        assert_ne!(b, c);
        assert_eq!(c.generation(), b.generation() + 1);
        assert!(arena.get(c).waiter(&guard).is_none());
        assert_eq!(arena.allocated(), 2);
    }

    #[test]
    fn concurrent_allocation_grows_segments_once() {
        let arena = NodeArena::new();
        let ids = scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let guard = epoch::pin();
                        (0..100)
                            .map(|_| arena.allocate(Some(ThreadHandle::current()), &guard))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        let unique: HashSet<u32> = ids.iter().map(|id| id.index()).collect();
        assert_eq!(unique.len(), 800);
        for id in ids {
            assert!(arena.get(id).owner().is_some());
        }
    }
}
