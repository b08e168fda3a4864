//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while scheduling guests.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no hypervisor can take guest {0}")]
    NoHypervisor(String),

    #[error("unknown job action: {0}")]
    UnknownAction(String),

    #[error("resource update for hypervisor {0} kept conflicting")]
    ResourceContention(String),

    #[error(transparent)]
    Core(#[from] flotilla_core::Error),

    #[error(transparent)]
    Queue(#[from] flotilla_jobqueue::QueueError),

    #[error("lock error: {0}")]
    Lock(#[from] flotilla_lock::LockError),

    #[error("state store error: {0}")]
    State(#[from] flotilla_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
