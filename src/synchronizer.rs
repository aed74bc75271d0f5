//! # Queued synchronizer
//!
//! A generic engine for blocking locks. A [Policy] decides what the state integer means and
//! when it can be taken or given back; the engine takes care of queueing, parking and waking.
//!
//! ## Acquire
//! - try the policy's fast path, done if it succeeds
//! - otherwise append a node to the wait queue and loop:
//!   - if our predecessor is the head, try again, on success our node becomes the head
//!   - else make sure the predecessor will wake us (status SIGNAL) and park
//!
//! Setting SIGNAL and parking are two separate steps: after the CAS we go around once more,
//! so a release that happens in-between is seen by the retry rather than lost.
//!
//! ## Release
//! The policy releases the state, then the head's first live successor is unparked.
//! The woken thread isn't handed the lock, it has to win the policy again.
//! A thread that just arrived may be faster, unless the policy is fair.
//!
//! ## Cancellation
//! A node whose thread gives up is marked CANCELLED and unlinked lazily: its neighbours
//! skip it on their next pass. If that can't be arranged, its successor is woken right away
//! so nobody is left waiting behind a dead node.
//!
//! Whoever moves a `prev` past a cancelled node retires it, and so does whoever moves the tail
//! back over it. Only one `prev` ever names a node, so each one is retired once.

use crossbeam::epoch::{self, Guard};
use tracing::trace;

use crate::{
    error::LockError,
    queue::{NodeId, NodeStatus, WaitQueue},
    state::{OwnerSlot, StateCell},
    thread::{OwnerToken, ThreadHandle},
};

/// The rules of a concrete lock.
pub trait Policy {
    /// Try to take `amount` without blocking.
    fn try_acquire(&self, sync: &SyncState, amount: i32) -> Result<bool, LockError>;

    /// Give `amount` back. `true` once the resource is fully released and a waiter may go.
    fn try_release(&self, sync: &SyncState, amount: i32) -> Result<bool, LockError>;
}

/// The state a [Policy] works with: the integer, the owner and a read-only view of the queue.
pub struct SyncState {
    state: StateCell,
    owner: OwnerSlot,
    queue: WaitQueue,
}

impl SyncState {
    fn new() -> Self {
        Self {
            state: StateCell::default(),
            owner: OwnerSlot::new(),
            queue: WaitQueue::new(),
        }
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    pub fn owner(&self) -> &OwnerSlot {
        &self.owner
    }

    /// Whether some other thread has been queued for longer than the caller.
    ///
    /// May miss a thread that's being enqueued right now, never reports a predecessor
    /// when the caller is the first waiter.
    pub fn has_queued_predecessor(&self) -> bool {
        let guard = epoch::pin();
        self.queue
            .has_queued_predecessor(OwnerToken::current(), &guard)
    }

    pub fn has_queued_threads(&self) -> bool {
        self.queue.has_queued_threads()
    }

    pub fn has_queued_thread(&self, token: OwnerToken) -> bool {
        let guard = epoch::pin();
        self.queue.has_queued_thread(token, &guard)
    }

    /// Estimate, the queue may change while it's counted.
    pub fn queue_length(&self) -> usize {
        let guard = epoch::pin();
        self.queue.queue_length(&guard)
    }

    /// Decide whether the thread of `node` can park now, `pred` being its predecessor.
    fn should_park_after_failed_acquire(
        &self,
        mut pred: NodeId,
        node: NodeId,
        guard: &Guard,
    ) -> bool {
        let queue = &self.queue;
        let status = queue.node(pred).status();
        match status {
            // it'll wake us
            NodeStatus::Signal => true,
            NodeStatus::Cancelled => {
                // only we touch our `prev`, so compact the chain and look again
                loop {
                    let skipped = pred;
                    pred = queue.predecessor(skipped);
                    queue.node(node).prev.store(Some(pred));
                    queue.retire(skipped, guard);
                    if !queue.node(pred).status().is_cancelled() {
                        break;
                    }
                }
                queue.node(pred).next.store(Some(node));
                trace!(?node, ?pred, "skipped cancelled predecessors");
                false
            }
            _ => {
                // ask for a wake-up but check once more before parking
                queue
                    .node(pred)
                    .compare_and_set_status(status, NodeStatus::Signal);
                false
            }
        }
    }

    /// Give up on `node`. Its thread won't touch the node afterwards.
    fn cancel_acquire(&self, node: NodeId) {
        let guard = epoch::pin();
        let queue = &self.queue;
        let this = queue.node(node);
        this.clear_owner();
        this.replace_waiter(None, &guard);

        let mut pred = queue.predecessor(node);
        while queue.node(pred).status().is_cancelled() {
            let skipped = pred;
            pred = queue.predecessor(skipped);
            this.prev.store(Some(pred));
            queue.retire(skipped, &guard);
        }
        let pred_next = queue.node(pred).next.load();

        // from here on others skip the node
        this.set_status(NodeStatus::Cancelled);
        trace!(?node, ?pred, "cancelled");

        if self.unlink_cancelled_tail(node, pred, pred_next, &guard) {
            return;
        }

        let before = queue.node(pred);
        let pred_will_signal = queue.head() != Some(pred)
            && match before.status() {
                NodeStatus::Signal => true,
                NodeStatus::Cancelled => false,
                status => before.compare_and_set_status(status, NodeStatus::Signal),
            }
            && before.owner().is_some();

        if pred_will_signal {
            if let Some(next) = this.next.load() {
                if queue.is_live(next) {
                    before.next.compare_and_set(pred_next, Some(next));
                }
            }
        } else {
            self.unpark_successor(node, &guard);
        }
    }

    /// Move the tail from the cancelled `node` back to `pred` and retire `node`.
    ///
    /// Goes on while the new tail turns out cancelled too: its own thread may have
    /// looked at the tail while `node` was still there. Returns false if `node` isn't the tail.
    fn unlink_cancelled_tail(
        &self,
        mut node: NodeId,
        mut pred: NodeId,
        mut pred_next: Option<NodeId>,
        guard: &Guard,
    ) -> bool {
        let queue = &self.queue;
        if queue.tail() != Some(node) || !queue.compare_and_set_tail(Some(node), Some(pred)) {
            return false;
        }
        loop {
            // a failed CAS means someone appended to `pred` meanwhile, fine either way
            queue.node(pred).next.compare_and_set(pred_next, None);
            queue.retire(node, guard);
            if !queue.node(pred).status().is_cancelled() {
                return true;
            }
            node = pred;
            pred = queue.predecessor(node);
            pred_next = queue.node(pred).next.load();
            if !queue.compare_and_set_tail(Some(node), Some(pred)) {
                // appended to, or its own thread unhooked it
                return true;
            }
            trace!(?node, ?pred, "unhooked a cancelled tail");
        }
    }

    /// Wake the first live waiter behind `node`.
    fn unpark_successor(&self, node: NodeId, guard: &Guard) {
        let queue = &self.queue;
        let this = queue.node(node);
        let status = this.status();
        if status == NodeStatus::Signal {
            // losing this race to a re-arming waiter is fine
            this.compare_and_set_status(status, NodeStatus::Neutral);
        }
        if let Some(successor) = queue.first_waiter_after(node) {
            if let Some(waiter) = queue.node(successor).waiter(guard) {
                trace!(?node, ?successor, "unparking");
                waiter.unpark();
            }
        }
    }
}

/// Whether an interrupt stops a queued acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Uninterruptible,
    Interruptible,
}

/// Runs `cancel_acquire` unless disarmed, so a node is never left behind by an early return or a panic.
struct CancelOnExit<'a> {
    sync: &'a SyncState,
    node: NodeId,
    armed: bool,
}

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sync.cancel_acquire(self.node);
        }
    }
}

/// A blocking synchronizer driven by the policy `P`.
pub struct Synchronizer<P> {
    sync: SyncState,
    policy: P,
}

impl<P: Policy> Synchronizer<P> {
    pub fn new(policy: P) -> Self {
        Self {
            sync: SyncState::new(),
            policy,
        }
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Take `amount`, blocking as long as needed.
    ///
    /// Interrupts don't stop it. One received while waiting is raised again on the calling thread
    /// once the resource is held. Errors come from the policy only; a node queued at that
    /// moment is cancelled before the error is returned.
    pub fn acquire(&self, amount: i32) -> Result<(), LockError> {
        if self.policy.try_acquire(&self.sync, amount)? {
            return Ok(());
        }
        let me = ThreadHandle::current();
        let node = self.sync.queue.add_waiter(&me, &epoch::pin());
        if self.acquire_queued(node, amount, &me, Wait::Uninterruptible)? {
            me.reinterrupt();
        }
        Ok(())
    }

    /// Like [Synchronizer::acquire], but an interrupt gives up with [LockError::Interrupted].
    ///
    /// The interrupt flag is consumed in that case.
    pub fn acquire_interruptibly(&self, amount: i32) -> Result<(), LockError> {
        let me = ThreadHandle::current();
        if me.take_interrupt() {
            return Err(LockError::Interrupted);
        }
        if self.policy.try_acquire(&self.sync, amount)? {
            return Ok(());
        }
        let node = self.sync.queue.add_waiter(&me, &epoch::pin());
        self.acquire_queued(node, amount, &me, Wait::Interruptible)
            .map(|_| ())
    }

    /// Returns whether an interrupt was swallowed along the way.
    #[cold]
    fn acquire_queued(
        &self,
        node: NodeId,
        amount: i32,
        me: &ThreadHandle,
        wait: Wait,
    ) -> Result<bool, LockError> {
        let queue = &self.sync.queue;
        let mut cancel = CancelOnExit {
            sync: &self.sync,
            node,
            armed: true,
        };
        let mut interrupted = false;
        loop {
            let guard = epoch::pin();
            let pred = queue.predecessor(node);
            if queue.head() == Some(pred) && self.policy.try_acquire(&self.sync, amount)? {
                queue.promote(node, pred, &guard);
                cancel.armed = false;
                trace!(?node, "acquired from the queue");
                return Ok(interrupted);
            }
            if !self.sync.should_park_after_failed_acquire(pred, node, &guard) {
                continue;
            }
            // parked threads must not hold back reclamation
            drop(guard);
            trace!(?node, "parking");
            me.park();
            if me.take_interrupt() {
                match wait {
                    Wait::Interruptible => return Err(LockError::Interrupted),
                    Wait::Uninterruptible => interrupted = true,
                }
            }
        }
    }

    /// Give back `amount`. On full release the first live waiter is woken.
    ///
    /// Returns whether the resource got fully released.
    pub fn release(&self, amount: i32) -> Result<bool, LockError> {
        if !self.policy.try_release(&self.sync, amount)? {
            return Ok(false);
        }
        let guard = epoch::pin();
        if let Some(head) = self.sync.queue.head() {
            if self.sync.queue.node(head).status() != NodeStatus::Neutral {
                self.sync.unpark_successor(head, &guard);
            }
        }
        Ok(true)
    }
}
