//! # Queued synchronizers
//!
//! Blocking locks out of a single atomic integer and a lock-free FIFO of parked threads.
//!
//! - [Synchronizer] is the engine: it queues, parks and wakes, a [Policy] says what the integer means
//! - [ReentrantLock] is a policy on top of it, fair or not
//!
//! There's no lower-level lock inside: every shared field is an atomic, changed either with a CAS
//! or by a thread that already won one.

pub mod error;
mod queue;
pub mod reentrant;
pub mod state;
pub mod synchronizer;
pub mod thread;

pub use error::LockError;
pub use queue::NodeStatus;
pub use reentrant::{Fairness, ReentrantLock, ReentrantLockGuard, ReentrantPolicy};
pub use state::{OwnerSlot, StateCell};
pub use synchronizer::{Policy, SyncState, Synchronizer};
pub use thread::{OwnerToken, ThreadHandle};
