//! # Thread identity, parking and interrupts
//!
//! The synchronizer needs 3 things from the runtime:
//! - an identity to compare owners by value, see [OwnerToken]
//! - a way to block the current thread and to wake a specific other one
//! - an interrupt request that wakes a parked thread without losing the request
//!
//! Blocking is `std::thread::park`. Its token is a one-shot permit: an `unpark` issued
//! before the target parks isn't lost, the next `park` returns right away.
//! `park` may also return spuriously, so every caller re-checks its condition in a loop.
//!
//! Rust threads have no interrupts, so there's a flag per thread living next to its [Thread] handle.
//! [ThreadHandle::interrupt] sets the flag and unparks the target.

use std::{
    num::NonZeroU64,
    sync::{
        atomic::{
            AtomicBool, AtomicU64,
            Ordering::{Relaxed, SeqCst},
        },
        Arc,
    },
    thread::{self, Thread},
};

/// Ids are never reused, 0 is reserved for "nobody".
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle::register();
}

/// Opaque identity of a thread, compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(NonZeroU64);

impl OwnerToken {
    /// The token of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|handle| handle.token())
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0.get()
    }

    /// `0` stands for "no owner"
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

#[derive(Debug)]
struct Inner {
    token: OwnerToken,
    thread: Thread,
    interrupted: AtomicBool,
}

/// Shareable handle to a thread: who it is, how to wake it and how to interrupt it.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    inner: Arc<Inner>,
}

impl ThreadHandle {
    fn register() -> Self {
        let raw = NEXT_TOKEN.fetch_add(1, Relaxed);
        // a u64 counter doesn't wrap in practice, 0 would mean the counter did
        let token = OwnerToken::from_raw(raw).expect("thread tokens exhausted");
        Self {
            inner: Arc::new(Inner {
                token,
                thread: thread::current(),
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// Handle of the calling thread. Every call on the same thread returns the same identity.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    pub fn token(&self) -> OwnerToken {
        self.inner.token
    }

    /// Ask the thread to stop waiting.
    ///
    /// An uninterruptible acquire keeps waiting and re-raises the request once it holds the lock.
    /// An interruptible one gives up with [LockError::Interrupted](crate::LockError::Interrupted).
    pub fn interrupt(&self) {
        // the flag must be visible before the thread returns from park
        self.inner.interrupted.store(true, SeqCst);
        self.inner.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(SeqCst)
    }

    /// Test and clear the flag.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, SeqCst)
    }

    /// Re-raise an interrupt swallowed while waiting. Nobody is parked, so there's nothing to wake.
    pub(crate) fn reinterrupt(&self) {
        self.inner.interrupted.store(true, SeqCst);
    }

    pub(crate) fn unpark(&self) {
        self.inner.thread.unpark();
    }

    /// Block the calling thread until it's unparked or interrupted. May return spuriously.
    ///
    /// Must only be called on the handle of the current thread.
    pub(crate) fn park(&self) {
        debug_assert_eq!(self.token(), OwnerToken::current());
        // a pending interrupt means there's no point in blocking,
        // its unpark permit may have been consumed by an earlier park already
        if !self.is_interrupted() {
            thread::park();
        }
    }
}

/// Whether the calling thread has been interrupted; clears the flag.
pub fn interrupted() -> bool {
    CURRENT.with(ThreadHandle::take_interrupt)
}

#[cfg(test)]
mod test {
    use std::{sync::mpsc, thread::scope};

    use super::*;

    #[test]
    fn token_is_stable_per_thread() {
        assert_eq!(OwnerToken::current(), OwnerToken::current());
        assert_eq!(ThreadHandle::current().token(), OwnerToken::current());

        let here = OwnerToken::current();
        let there = scope(|s| s.spawn(OwnerToken::current).join().unwrap());
        assert_ne!(here, there);
    }

    #[test]
    fn raw_zero_is_nobody() {
        assert_eq!(OwnerToken::from_raw(0), None);
        let token = OwnerToken::current();
        assert_eq!(OwnerToken::from_raw(token.as_raw()), Some(token));
    }

    #[test]
    fn interrupt_sets_and_clears() {
        let me = ThreadHandle::current();
        assert!(!me.is_interrupted());
        me.interrupt();
        assert!(me.is_interrupted());
        // the permit is there, the flag short-circuits anyway
        me.park();
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!me.is_interrupted());
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let (tx, rx) = mpsc::channel();
        scope(|s| {
            let t = s.spawn(move || {
                let me = ThreadHandle::current();
                tx.send(me.clone()).unwrap();
                // wait for the permit to be granted first
                while !me.is_interrupted() {
                    std::hint::spin_loop();
                }
                me.take_interrupt();
                // the unpark came before, so this returns (possibly spuriously earlier, but it returns)
                me.park();
            });
            let handle = rx.recv().unwrap();
            handle.unpark();
            handle.reinterrupt();
            t.join().unwrap();
        });
    }
}
