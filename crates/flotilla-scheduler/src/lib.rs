//! flotilla-scheduler — drives guests from job to placement.
//!
//! Consumes the two tubes of the work queue:
//!
//! - **create** — `select-hypervisor` jobs: pick the first live hypervisor
//!   (by ID) whose available resources cover the guest's flavor, take its
//!   lease lock, run the placement engine and charge the flavor against the
//!   hypervisor.
//! - **work** — `delete` runs here; lifecycle actions (start, reboot, ...)
//!   are released for the hypervisor agent; anything else fails the job.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Client (flotilla-jobqueue: reserve / release / delete tasks)
//!   ├── Context (flotilla-core: entities, Hypervisor::add_guest)
//!   └── Lock per hypervisor (flotilla-lock: locks/hypervisors/<id>)
//! ```

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{DELETE_ACTION, LIFECYCLE_ACTIONS, Scheduler, SchedulerConfig, TaskOutcome};
