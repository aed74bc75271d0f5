use std::sync::atomic::{
    AtomicI32, AtomicU32, AtomicU64,
    Ordering::{Relaxed, SeqCst},
};

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use strum_macros::{Display, FromRepr};

use crate::thread::{OwnerToken, ThreadHandle};

/// Where a queued node is in its life.
///
/// Only positive means cancelled, so "can this node still be woken" is `<= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum NodeStatus {
    /// Abandoned by its thread. Terminal.
    Cancelled = 1,
    Neutral = 0,
    /// The node promised to wake its successor on release.
    Signal = -1,
    /// Reserved for condition queues, never assigned here.
    Condition = -2,
    /// Reserved for shared mode, never assigned here.
    Propagate = -3,
}

impl NodeStatus {
    pub fn is_cancelled(self) -> bool {
        self == NodeStatus::Cancelled
    }
}

/// A slot of the arena, and which use of that slot is meant.
///
/// The generation goes up every time the slot leaves the queue, so an id kept around
/// for longer than its node compares unequal to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Index no slot ever has
    pub(crate) const NIL: u32 = u32::MAX;

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        debug_assert_ne!(index, Self::NIL);
        Self { index, generation }
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

/// An atomic, nullable reference to another node of the same arena.
#[derive(Debug)]
pub(crate) struct Link(AtomicU64);

impl Link {
    const UNSET: u64 = u64::MAX;

    pub(crate) const fn unset() -> Self {
        Self(AtomicU64::new(Self::UNSET))
    }

    fn encode(id: Option<NodeId>) -> u64 {
        id.map_or(Self::UNSET, |id| {
            (u64::from(id.generation) << 32) | u64::from(id.index)
        })
    }

    pub(crate) fn load(&self) -> Option<NodeId> {
        match self.0.load(SeqCst) {
            Self::UNSET => None,
            raw => Some(NodeId::new(raw as u32, (raw >> 32) as u32)),
        }
    }

    pub(crate) fn store(&self, id: Option<NodeId>) {
        self.0.store(Self::encode(id), SeqCst);
    }

    pub(crate) fn compare_and_set(&self, expect: Option<NodeId>, update: Option<NodeId>) -> bool {
        self.0
            .compare_exchange(Self::encode(expect), Self::encode(update), SeqCst, SeqCst)
            .is_ok()
    }
}

/// One per thread waiting in the queue, plus the sentinel head.
///
/// `prev` is set before the node is published and is the reliable way back to the head,
/// `next` is filled in after the tail CAS and may lag behind, or name a node that left already.
#[derive(Debug)]
pub(crate) struct Node {
    status: AtomicI32,
    pub(crate) prev: Link,
    pub(crate) next: Link,
    /// token of the waiting thread, 0 once it's the head or gave up
    owner: AtomicU64,
    generation: AtomicU32,
    /// swapped out boxes are destroyed through the epoch, a pinned reader keeps its copy alive
    waiter: Atomic<ThreadHandle>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            status: AtomicI32::new(NodeStatus::Neutral as i32),
            prev: Link::unset(),
            next: Link::unset(),
            owner: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            waiter: Atomic::null(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // SAFETY: `&mut self`, nobody can be reading the waiter anymore
        unsafe {
            let waiter = self.waiter.load(Relaxed, epoch::unprotected());
            if !waiter.is_null() {
                drop(waiter.into_owned());
            }
        }
    }
}

impl Node {
    pub(crate) fn status(&self) -> NodeStatus {
        let raw = self.status.load(SeqCst);
        NodeStatus::from_repr(raw).unwrap_or_else(|| unreachable!("node status {raw}"))
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.status.store(status as i32, SeqCst);
    }

    pub(crate) fn compare_and_set_status(&self, expect: NodeStatus, update: NodeStatus) -> bool {
        self.status
            .compare_exchange(expect as i32, update as i32, SeqCst, SeqCst)
            .is_ok()
    }

    pub(crate) fn owner(&self) -> Option<OwnerToken> {
        OwnerToken::from_raw(self.owner.load(SeqCst))
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.store(0, SeqCst);
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(SeqCst)
    }

    /// Move on to the next generation, ids handed out so far turn stale.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, SeqCst);
    }

    /// The thread to unpark, if it's still interested.
    pub(crate) fn waiter<'g>(&self, guard: &'g Guard) -> Option<&'g ThreadHandle> {
        // SAFETY: only `replace_waiter` unlinks a box, and it destroys it through the epoch
        unsafe { self.waiter.load(SeqCst, guard).as_ref() }
    }

    /// Swap in another waiter; the old handle goes once every pinned reader let go of it.
    pub(crate) fn replace_waiter(&self, waiter: Option<ThreadHandle>, guard: &Guard) {
        let fresh = waiter.map_or_else(Shared::null, |w| Owned::new(w).into_shared(guard));
        let old = self.waiter.swap(fresh, SeqCst, guard);
        if !old.is_null() {
            // SAFETY: unlinked just now, and no new reader can load it
            unsafe { guard.defer_destroy(old) };
        }
    }

    /// Bring the node back to a blank state for a new waiter (or none, for a sentinel).
    ///
    /// Only for a node that no other thread can reach through a link.
    pub(crate) fn reset(&self, waiter: Option<ThreadHandle>, guard: &Guard) {
        self.set_status(NodeStatus::Neutral);
        self.prev.store(None);
        self.next.store(None);
        self.owner
            .store(waiter.as_ref().map_or(0, |w| w.token().as_raw()), SeqCst);
        self.replace_waiter(waiter, guard);
    }
}
