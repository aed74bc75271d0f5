use thiserror::Error;

/// Everything that can go wrong when talking to a synchronizer.
///
/// CAS retries are never reported here, they're just how the queue works.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The caller tried to release a lock it doesn't hold.
    #[error("lock released by a thread that does not own it")]
    NotOwner,
    /// The reentrant hold count would not fit into the state anymore.
    #[error("maximum lock count exceeded")]
    HoldCountOverflow,
    /// The operation exists on the surface only.
    #[error("`{0}` is not supported")]
    Unsupported(&'static str),
    /// An interruptible acquisition was given up.
    #[error("acquisition interrupted")]
    Interrupted,
}
