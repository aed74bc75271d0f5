//! # Reentrant lock
//!
//! An exclusive lock the holder can take again without blocking. The synchronizer's state is
//! the hold count: 0 - free, N - taken N times by the recorded owner.
//!
//! ## Fairness
//! A non-fair lock lets a newcomer grab a free lock even if others are queued. It's faster,
//! as the woken waiter needs some time to get going and the lock would idle meanwhile.
//! A fair one checks the queue first, so the threads that already wait go in FIFO order.
//!
//! ## Unsupported
//! Interruptible and timed locking, `try_lock` and conditions are on the surface, but fail
//! with [LockError::Unsupported] straight away.

use std::{convert::Infallible, marker::PhantomData, time::Duration};

use strum_macros::{Display, EnumIter, EnumString};
use tracing::{debug, warn};

use crate::{
    error::LockError,
    synchronizer::{Policy, SyncState, Synchronizer},
    thread::{OwnerToken, ThreadHandle},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Fairness {
    Fair,
    #[default]
    NonFair,
}

/// Hold-count rules for [ReentrantLock].
#[derive(Debug, Clone, Copy)]
pub struct ReentrantPolicy {
    fairness: Fairness,
}

impl ReentrantPolicy {
    pub fn new(fairness: Fairness) -> Self {
        Self { fairness }
    }

    pub fn fairness(&self) -> Fairness {
        self.fairness
    }

    /// The owner takes more, the count must stay positive.
    fn reenter(sync: &SyncState, held: i32, amount: i32) -> Result<bool, LockError> {
        match held.checked_add(amount) {
            Some(count) if count >= 0 => {
                // only the owner writes while the count is non-zero
                sync.state().set(count);
                Ok(true)
            }
            _ => Err(LockError::HoldCountOverflow),
        }
    }
}

impl Policy for ReentrantPolicy {
    fn try_acquire(&self, sync: &SyncState, amount: i32) -> Result<bool, LockError> {
        let held = sync.state().get();
        if held == 0 {
            let may_take = match self.fairness {
                Fairness::NonFair => true,
                Fairness::Fair => !sync.has_queued_predecessor(),
            };
            if may_take && sync.state().compare_and_set(0, amount) {
                sync.owner().set(Some(OwnerToken::current()));
                return Ok(true);
            }
        } else if sync.owner().is_current() {
            return Self::reenter(sync, held, amount);
        }
        Ok(false)
    }

    fn try_release(&self, sync: &SyncState, amount: i32) -> Result<bool, LockError> {
        if !sync.owner().is_current() {
            return Err(LockError::NotOwner);
        }
        let count = sync.state().get() - amount;
        let free = count == 0;
        if free {
            sync.owner().set(None);
        }
        sync.state().set(count);
        Ok(free)
    }
}

/// A reentrant mutual exclusion lock.
///
/// ```
/// use std::thread;
/// use queued_sync::ReentrantLock;
///
/// let lock = ReentrantLock::new(true);
/// thread::scope(|s| {
///     s.spawn(|| {
///         let _guard = lock.guard();
///         assert!(lock.is_held_by_current_thread());
///     });
/// });
/// assert!(!lock.is_locked());
/// ```
pub struct ReentrantLock {
    sync: Synchronizer<ReentrantPolicy>,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::with_fairness(Fairness::default())
    }
}

impl ReentrantLock {
    pub fn new(fair: bool) -> Self {
        Self::with_fairness(if fair {
            Fairness::Fair
        } else {
            Fairness::NonFair
        })
    }

    pub fn with_fairness(fairness: Fairness) -> Self {
        debug!(%fairness, "new reentrant lock");
        Self {
            sync: Synchronizer::new(ReentrantPolicy::new(fairness)),
        }
    }

    /// Block until the lock is held by the calling thread, or just count one more hold if it already is.
    ///
    /// # Panics
    /// If the hold count overflows.
    pub fn lock(&self) {
        let sync = self.sync.sync_state();
        // a non-fair lock doesn't care about the queue, so try the cheapest thing first
        if self.sync.policy().fairness() == Fairness::NonFair && sync.state().compare_and_set(0, 1)
        {
            sync.owner().set(Some(OwnerToken::current()));
            return;
        }
        if let Err(err) = self.sync.acquire(1) {
            panic!("{err}");
        }
    }

    /// Drop one hold, the lock is free once all of them are gone.
    pub fn unlock(&self) -> Result<(), LockError> {
        self.sync.release(1).map(|_| ())
    }

    /// Lock and get a guard that unlocks when dropped.
    pub fn guard(&self) -> ReentrantLockGuard<'_> {
        self.lock();
        ReentrantLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    pub fn lock_interruptibly(&self) -> Result<(), LockError> {
        Err(LockError::Unsupported("lock_interruptibly"))
    }

    pub fn try_lock(&self) -> Result<bool, LockError> {
        Err(LockError::Unsupported("try_lock"))
    }

    pub fn try_lock_for(&self, _timeout: Duration) -> Result<bool, LockError> {
        Err(LockError::Unsupported("try_lock_for"))
    }

    pub fn new_condition(&self) -> Result<Infallible, LockError> {
        Err(LockError::Unsupported("new_condition"))
    }

    pub fn is_fair(&self) -> bool {
        self.sync.policy().fairness() == Fairness::Fair
    }

    pub fn is_locked(&self) -> bool {
        self.sync.sync_state().state().get() != 0
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.sync.sync_state().owner().is_current()
    }

    /// Holds of the calling thread, 0 if it doesn't own the lock.
    pub fn hold_count(&self) -> i32 {
        let sync = self.sync.sync_state();
        if sync.owner().is_current() {
            sync.state().get()
        } else {
            0
        }
    }

    pub fn has_queued_threads(&self) -> bool {
        self.sync.sync_state().has_queued_threads()
    }

    pub fn has_queued_thread(&self, thread: &ThreadHandle) -> bool {
        self.sync.sync_state().has_queued_thread(thread.token())
    }

    /// An estimate of how many threads wait for the lock.
    pub fn queue_length(&self) -> usize {
        self.sync.sync_state().queue_length()
    }
}

/// Holds the lock for its lifetime. Stays on the thread that locked, as only the owner may unlock.
pub struct ReentrantLockGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReentrantLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            warn!(%err, "guard failed to unlock");
        }
    }
}
