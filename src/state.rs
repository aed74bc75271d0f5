//! # State cell and owner slot
//!
//! The whole synchronizer state is a single `i32`. What it means is up to the [Policy](crate::Policy):
//! the reentrant lock reads it as a hold count.
//!
//! All the accesses are `SeqCst`. A releaser writes the state then reads the head's status,
//! a waiter writes the head's status then reads the state. That's a store-load pair on 2 different
//! atomics, and only a total order makes sure at least one of them sees the other's write.

use std::sync::atomic::{
    AtomicI32, AtomicU64,
    Ordering::{Relaxed, SeqCst},
};

use crate::thread::OwnerToken;

/// The only way to touch the synchronizer's integer.
#[derive(Debug, Default)]
pub struct StateCell(AtomicI32);

impl StateCell {
    pub const fn new(value: i32) -> Self {
        Self(AtomicI32::new(value))
    }

    pub fn get(&self) -> i32 {
        self.0.load(SeqCst)
    }

    /// Plain store, only for a caller that already owns the state
    pub fn set(&self, value: i32) {
        self.0.store(value, SeqCst);
    }

    pub fn compare_and_set(&self, expect: i32, update: i32) -> bool {
        self.0
            .compare_exchange(expect, update, SeqCst, SeqCst)
            .is_ok()
    }
}

/// Who holds the resource exclusively, if anyone.
///
/// Relaxed is enough: the only value a thread acts upon is its own token,
/// and it always sees its own latest write. Everything else is ordered by the state cell.
#[derive(Debug, Default)]
pub struct OwnerSlot(AtomicU64);

impl OwnerSlot {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> Option<OwnerToken> {
        OwnerToken::from_raw(self.0.load(Relaxed))
    }

    pub fn set(&self, owner: Option<OwnerToken>) {
        self.0.store(owner.map_or(0, OwnerToken::as_raw), Relaxed);
    }

    pub fn is_current(&self) -> bool {
        self.get() == Some(OwnerToken::current())
    }
}

#[cfg(test)]
mod test {
    use std::thread::scope;

    use super::*;

    #[test]
    fn compare_and_set_only_on_match() {
        let state = StateCell::new(0);
        assert!(!state.compare_and_set(1, 2));
        assert_eq!(state.get(), 0);
        assert!(state.compare_and_set(0, 2));
        assert_eq!(state.get(), 2);
        state.set(-7);
        assert_eq!(state.get(), -7);
    }

    #[test]
    fn cas_admits_exactly_one_winner() {
        let state = StateCell::default();
        let winners = scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| state.compare_and_set(0, 1)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
        assert_eq!(state.get(), 1);
    }

    #[test]
    fn owner_is_compared_by_token() {
        let owner = OwnerSlot::new();
        assert_eq!(owner.get(), None);
        assert!(!owner.is_current());

        owner.set(Some(OwnerToken::current()));
        assert!(owner.is_current());
        scope(|s| s.spawn(|| assert!(!owner.is_current())).join().unwrap());

        owner.set(None);
        assert_eq!(owner.get(), None);
    }
}
