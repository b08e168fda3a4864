//! Lock error types.

use flotilla_state::StateError;
use thiserror::Error;

/// Errors from lease lock operations.
///
/// `KeyNotFound` and `LockNotHeld` never overlap: the first means the lease
/// was held by this handle and has since expired, the second that the
/// handle does not (or no longer) hold anything.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held: {0}")]
    AlreadyHeld(String),

    #[error("lock not held: {0}")]
    LockNotHeld(String),

    #[error("lock key not found (lease expired): {0}")]
    KeyNotFound(String),

    #[error("timed out waiting for lock: {0}")]
    Timeout(String),

    #[error("change notifications closed while waiting for lock: {0}")]
    WatchClosed(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type LockResult<T> = Result<T, LockError>;
