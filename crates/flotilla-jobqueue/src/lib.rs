//! flotilla-jobqueue — turns entity mutations into retryable tasks.
//!
//! A [`Job`] is a durable record (`jobs/<id>`, TTL'd) naming a guest and an
//! action. A [`Task`] is one at-least-once delivery of a job ID through a
//! tube: `select-hypervisor` jobs go to the `create` tube, everything else
//! to `work`. Reserved tasks come back hydrated with their job and guest.
//!
//! ```text
//! put ──▶ ready ──reserve──▶ reserved ──delete──▶ gone
//!           ▲                  │
//!           └──release(delay)──┤
//!           └──ttr elapsed─────┘
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod memory;
pub mod task;
pub mod tube;

pub use client::{CREATE_TUBE, Client, QueueConfig, SELECT_HYPERVISOR, WORK_TUBE};
pub use error::{QueueError, QueueResult};
pub use job::{Job, JobRecord, JobStatus};
pub use memory::{MemoryQueue, TubeStats};
pub use task::Task;
pub use tube::{Reservation, TaskId, TubeQueue};
