//! Queue error types.

use thiserror::Error;

use crate::task::Task;
use crate::tube::TaskId;

/// Errors from the work-queue client.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("timed out reserving from tube {0}")]
    Timeout(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task has no job loaded")]
    MissingJob,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} has no guest")]
    NoGuest(String),

    #[error("guest not found: {0}")]
    GuestNotFound(String),

    /// A task was reserved but its job or guest could not be loaded. The
    /// partially loaded task is returned so it can still be released or
    /// deleted.
    #[error("failed to load task {}: {source}", .task.id)]
    Hydration {
        task: Box<Task>,
        source: Box<QueueError>,
    },

    #[error(transparent)]
    Core(#[from] flotilla_core::Error),
}

impl QueueError {
    /// True if the task can never succeed: its job or guest is gone.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::MissingJob | Self::JobNotFound(_) | Self::NoGuest(_) | Self::GuestNotFound(_) => {
                true
            }
            Self::Hydration { source, .. } => source.is_permanent(),
            _ => false,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
