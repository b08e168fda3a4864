//! The work-queue transport seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

/// Queue-assigned delivery ID. Stable across redeliveries of the same task.
pub type TaskId = u64;

/// A reserved task body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: TaskId,
    pub body: String,
}

/// A named-tube task queue with reserve / release / delete semantics.
///
/// A reserved task is invisible to other consumers for `ttr`; if neither
/// deleted nor released by then it becomes ready again under the same ID.
#[async_trait]
pub trait TubeQueue: Send + Sync {
    /// Enqueue `body` on `tube`.
    async fn put(&self, tube: &str, body: &str) -> QueueResult<TaskId>;

    /// Block until a task on `tube` can be reserved.
    async fn reserve(&self, tube: &str, ttr: Duration) -> QueueResult<Reservation>;

    /// Remove a task permanently.
    async fn delete(&self, id: TaskId) -> QueueResult<()>;

    /// Return a task to its tube, ready again after `delay`.
    async fn release(&self, id: TaskId, delay: Duration) -> QueueResult<()>;
}
