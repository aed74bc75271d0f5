//! # Wait queue
//!
//! A FIFO of parked threads built from CAS-linked nodes only. The head is a sentinel that stands
//! for "whoever holds the resource", it's created lazily on the first contention.
//!
//! Every successful tail CAS appends a node, their order is the FIFO order.
//! `prev` of a node is valid right after the CAS, but its predecessor's `next` is linked a moment later.
//! So walking forward from the head may stop short; walking back from the tail never does.
//!
//! Nodes are read while pinned in a `crossbeam` epoch. The only node a thread may touch unpinned
//! is its own, nobody recycles a node whose thread is still waiting on it.
//!
//! A node leaves through [WaitQueue::retire] once neither the head, the tail nor any `prev` names it.
//! A `next` may still do for a while. Retiring bumps the slot's generation, so such a `next`
//! reads as stale instead of pointing at whoever gets the slot afterwards.

mod arena;
mod node;

use std::sync::Arc;

use crossbeam::epoch::Guard;
use tracing::trace;

use crate::thread::{OwnerToken, ThreadHandle};
use arena::NodeArena;
use node::{Link, Node};
pub(crate) use node::NodeId;
pub use node::NodeStatus;

pub(crate) struct WaitQueue {
    arena: Arc<NodeArena>,
    head: Link,
    tail: Link,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            arena: Arc::new(NodeArena::new()),
            head: Link::unset(),
            tail: Link::unset(),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.arena.get(id)
    }

    pub(crate) fn head(&self) -> Option<NodeId> {
        self.head.load()
    }

    pub(crate) fn tail(&self) -> Option<NodeId> {
        self.tail.load()
    }

    pub(crate) fn compare_and_set_tail(&self, expect: Option<NodeId>, update: Option<NodeId>) -> bool {
        self.tail.compare_and_set(expect, update)
    }

    /// `prev` of a node that isn't the head.
    ///
    /// # Panics
    /// If the node lost its predecessor, which means the queue is broken.
    pub(crate) fn predecessor(&self, id: NodeId) -> NodeId {
        match self.node(id).prev.load() {
            Some(prev) => prev,
            None => panic!("queued node {id:?} has no predecessor"),
        }
    }

    /// Create a node for `waiter` and append it, returns the new node.
    pub(crate) fn add_waiter(&self, waiter: &ThreadHandle, guard: &Guard) -> NodeId {
        let id = self.arena.allocate(Some(waiter.clone()), guard);
        let pred = self.enqueue(id, guard);
        trace!(node = ?id, ?pred, "enqueued");
        id
    }

    /// Append a private node, returns its predecessor at the time of the append.
    pub(crate) fn enqueue(&self, id: NodeId, guard: &Guard) -> NodeId {
        let node = self.node(id);
        loop {
            match self.tail.load() {
                Some(tail) => {
                    node.prev.store(Some(tail));
                    if self.tail.compare_and_set(Some(tail), Some(id)) {
                        self.node(tail).next.store(Some(id));
                        return tail;
                    }
                }
                None => {
                    // first contention: install the sentinel, tail follows the head
                    let sentinel = self.arena.allocate(None, guard);
                    if self.head.compare_and_set(None, Some(sentinel)) {
                        self.tail.store(Some(sentinel));
                    } else {
                        // never published, no need to wait for readers
                        self.arena.recycle(sentinel);
                    }
                }
            }
        }
    }

    /// Make `id` the new sentinel head in place of `old_head`, its direct predecessor.
    ///
    /// Only the thread owning `id` calls this, right after it acquired the resource.
    pub(crate) fn promote(&self, id: NodeId, old_head: NodeId, guard: &Guard) {
        let node = self.node(id);
        // a head never shows up as a waiter
        node.clear_owner();
        node.prev.store(None);
        self.head.store(Some(id));
        self.node(old_head).next.store(None);
        self.retire(old_head, guard);
    }

    /// Give the slot of an unreachable node back once every thread pinned now has let go.
    ///
    /// The caller makes sure neither the head, the tail nor a `prev` names `id`,
    /// and that nobody else retires it.
    pub(crate) fn retire(&self, id: NodeId, guard: &Guard) {
        let node = self.node(id);
        node.replace_waiter(None, guard);
        node.bump_generation();
        let arena = Arc::clone(&self.arena);
        guard.defer(move || arena.recycle(id));
    }

    /// Whether `id` still names the node in its slot and that node wasn't cancelled.
    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.generation() == id.generation()
            && !node.status().is_cancelled()
            // the status belongs to `id` only if the slot wasn't retired meanwhile
            && node.generation() == id.generation()
    }

    /// First node after `from` that isn't cancelled.
    ///
    /// `from.next` is the quick answer, the tail walk covers a lagging or stale `next`.
    pub(crate) fn first_waiter_after(&self, from: NodeId) -> Option<NodeId> {
        if let Some(next) = self.node(from).next.load() {
            if self.is_live(next) {
                return Some(next);
            }
        }
        let mut found = None;
        let mut cursor = self.tail.load();
        while let Some(id) = cursor {
            if id == from {
                break;
            }
            let node = self.node(id);
            if !node.status().is_cancelled() {
                found = Some(id);
            }
            cursor = node.prev.load();
        }
        found
    }

    /// Whether a thread other than `me` is ahead in the queue.
    pub(crate) fn has_queued_predecessor(&self, me: OwnerToken, _guard: &Guard) -> bool {
        // tail first: if the head is read first it may be installed after we saw no tail
        let tail = self.tail.load();
        let head = self.head.load();
        let Some(head) = head else {
            return false;
        };
        if tail == Some(head) {
            return false;
        }
        match self.first_waiter_after(head) {
            Some(first) => self.node(first).owner() != Some(me),
            None => false,
        }
    }

    pub(crate) fn has_queued_threads(&self) -> bool {
        self.head.load() != self.tail.load()
    }

    /// Live waiters, counted back from the tail.
    pub(crate) fn queue_length(&self, _guard: &Guard) -> usize {
        self.waiters().count()
    }

    pub(crate) fn has_queued_thread(&self, token: OwnerToken, _guard: &Guard) -> bool {
        self.waiters().any(|owner| owner == token)
    }

    /// Owners of the queued nodes, tail first. Must be consumed while pinned.
    fn waiters(&self) -> impl Iterator<Item = OwnerToken> + '_ {
        let mut cursor = self.tail.load();
        std::iter::from_fn(move || loop {
            let node = self.node(cursor?);
            cursor = node.prev.load();
            if let Some(owner) = node.owner() {
                return Some(owner);
            }
        })
    }

    /// `(status, owner)` of every node from the head to the tail, walked through `prev`.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<(NodeStatus, Option<OwnerToken>)> {
        let _guard = crossbeam::epoch::pin();
        let mut nodes = Vec::new();
        let mut cursor = self.tail.load();
        while let Some(id) = cursor {
            let node = self.node(id);
            nodes.push((node.status(), node.owner()));
            cursor = node.prev.load();
        }
        nodes.reverse();
        nodes
    }

    /// Statuses reachable through `next` from the head's successor.
    #[cfg(test)]
    pub(crate) fn forward_statuses(&self) -> Vec<NodeStatus> {
        let _guard = crossbeam::epoch::pin();
        let mut statuses = Vec::new();
        let mut cursor = self.head.load().and_then(|head| self.node(head).next.load());
        while let Some(id) = cursor {
            let node = self.node(id);
            if node.generation() != id.generation() {
                break;
            }
            statuses.push(node.status());
            cursor = node.next.load();
        }
        statuses
    }

    #[cfg(test)]
    pub(crate) fn allocated_slots(&self) -> u32 {
        self.arena.allocated()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicBool, Ordering::SeqCst},
        thread::scope,
    };

    use crossbeam::epoch;

    use super::*;

    #[test]
    fn first_enqueue_installs_the_sentinel() {
        let queue = WaitQueue::new();
        assert_eq!(queue.head(), None);
        assert_eq!(queue.tail(), None);
        assert!(!queue.has_queued_threads());

        let me = ThreadHandle::current();
        let guard = epoch::pin();
        let id = queue.add_waiter(&me, &guard);

        let head = queue.head().unwrap();
        assert_eq!(queue.tail(), Some(id));
        assert_eq!(queue.predecessor(id), head);
        assert_eq!(queue.node(head).next.load(), Some(id));
        assert_eq!(queue.node(head).owner(), None);
        assert!(queue.has_queued_threads());
        assert_eq!(queue.queue_length(&guard), 1);
        assert!(queue.has_queued_thread(me.token(), &guard));
    }

    #[test]
    fn tail_cas_order_is_fifo_order() {
        let queue = WaitQueue::new();
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let guard = epoch::pin();
                    for _ in 0..50 {
                        queue.add_waiter(&ThreadHandle::current(), &guard);
                    }
                });
            }
        });
        let nodes = queue.snapshot();
        // sentinel plus everybody
        assert_eq!(nodes.len(), 201);
        assert_eq!(nodes[0].1, None);
        assert!(nodes[1..].iter().all(|(status, owner)| {
            *status == NodeStatus::Neutral && owner.is_some()
        }));
        // and the forward links agree with the backward ones
        assert_eq!(queue.forward_statuses().len(), 200);
    }

    #[test]
    fn predecessor_check_looks_at_the_first_live_waiter() {
        let queue = WaitQueue::new();
        let guard = epoch::pin();
        let me = ThreadHandle::current();
        assert!(!queue.has_queued_predecessor(me.token(), &guard));

        let mine = queue.add_waiter(&me, &guard);
        assert!(!queue.has_queued_predecessor(me.token(), &guard));
        let from_elsewhere = || {
            scope(|s| {
                s.spawn(|| queue.has_queued_predecessor(OwnerToken::current(), &epoch::pin()))
                    .join()
                    .unwrap()
            })
        };
        assert!(from_elsewhere());

        // a cancelled first node is skipped over
        queue.node(mine).set_status(NodeStatus::Cancelled);
        queue.node(mine).clear_owner();
        assert!(!from_elsewhere());
    }

    #[test]
    fn lagging_next_falls_back_to_the_tail_walk() {
        let queue = WaitQueue::new();
        let guard = epoch::pin();
        let me = ThreadHandle::current();
        let first = queue.add_waiter(&me, &guard);
        let head = queue.head().unwrap();
        // pretend the enqueuer didn't get to link `next` yet
        queue.node(head).next.store(None);
        assert_eq!(queue.first_waiter_after(head), Some(first));
        assert!(!queue.has_queued_predecessor(me.token(), &guard));
    }

    #[test]
    fn promotion_clears_the_new_head() {
        let queue = WaitQueue::new();
        let guard = epoch::pin();
        let me = ThreadHandle::current();
        let id = queue.add_waiter(&me, &guard);
        let old = queue.head().unwrap();

        queue.promote(id, old, &guard);
        assert_eq!(queue.head(), Some(id));
        assert_eq!(queue.node(id).owner(), None);
        assert_eq!(queue.node(id).prev.load(), None);
        assert!(!queue.has_queued_threads());
        assert_eq!(queue.queue_length(&guard), 0);
    }

    #[test]
    fn a_published_head_has_no_owner() {
        let queue = WaitQueue::new();
        let done = AtomicBool::new(false);
        scope(|s| {
            s.spawn(|| {
                let me = ThreadHandle::current();
                for _ in 0..10_000 {
                    let guard = epoch::pin();
                    let id = queue.add_waiter(&me, &guard);
                    queue.promote(id, queue.predecessor(id), &guard);
                }
                done.store(true, SeqCst);
            });
            while !done.load(SeqCst) {
                let _guard = epoch::pin();
                if let Some(head) = queue.head() {
                    assert_eq!(queue.node(head).owner(), None);
                }
            }
        });
        assert_eq!(queue.queue_length(&epoch::pin()), 0);
    }

    #[test]
    fn next_of_a_retired_node_reads_as_stale() {
        let queue = WaitQueue::new();
        let guard = epoch::pin();
        let me = ThreadHandle::current();
        let first = queue.add_waiter(&me, &guard);
        let head = queue.head().unwrap();

        // unhook `first` the way a cancelled tail is, but leave the head's `next` behind
        queue.node(first).set_status(NodeStatus::Cancelled);
        assert!(queue.compare_and_set_tail(Some(first), Some(head)));
        queue.retire(first, &guard);
        assert_eq!(queue.node(head).next.load(), Some(first));
        assert!(!queue.is_live(first));
        assert!(queue.node(first).waiter(&guard).is_none());

        // the stale link is ignored, the tail walk finds nobody
        assert_eq!(queue.first_waiter_after(head), None);
        assert!(queue.forward_statuses().is_empty());
        assert!(!queue.has_queued_predecessor(OwnerToken::current(), &guard));

        let second = queue.add_waiter(&me, &guard);
        assert_eq!(queue.first_waiter_after(head), Some(second));
        assert_eq!(queue.forward_statuses(), vec![NodeStatus::Neutral]);
        assert_eq!(queue.queue_length(&guard), 1);
    }
}
