//! Task — one delivery of a job through a tube.

use std::fmt;

use tracing::{debug, info, warn};

use flotilla_core::{Error as CoreError, Guest};

use crate::client::Client;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobStatus};
use crate::tube::TaskId;

/// Attempts at a job status write before giving up on conflicts.
const STATUS_RETRIES: usize = 3;

/// A reserved task with its job and guest.
pub struct Task {
    pub id: TaskId,
    pub job_id: String,
    pub job: Option<Job>,
    pub guest: Option<Guest>,
    client: Client,
}

impl Task {
    pub(crate) fn new(client: Client, id: TaskId, job_id: String) -> Self {
        Self {
            id,
            job_id,
            job: None,
            guest: None,
            client,
        }
    }

    /// Load the job, then the guest it names.
    pub(crate) fn hydrate(&mut self) -> QueueResult<()> {
        self.refresh_job()?;
        self.refresh_guest()
    }

    /// Reload the job record.
    pub fn refresh_job(&mut self) -> QueueResult<()> {
        self.job = Some(self.client.job(&self.job_id)?);
        Ok(())
    }

    /// Reload the guest named by the loaded job.
    pub fn refresh_guest(&mut self) -> QueueResult<()> {
        let job = self.job.as_ref().ok_or(QueueError::MissingJob)?;
        if job.guest.is_empty() {
            return Err(QueueError::NoGuest(job.id.clone()));
        }
        match self.client.ctx().guest(&job.guest) {
            Ok(guest) => {
                self.guest = Some(guest);
                Ok(())
            }
            Err(CoreError::NotFound { .. }) => Err(QueueError::GuestNotFound(job.guest.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the task to its tube after the configured delay.
    ///
    /// A job marked working goes back to queued first, while the task is
    /// still reserved, so the write cannot land on top of the next consumer's.
    pub async fn release(&mut self) -> QueueResult<()> {
        if self.job.as_ref().is_some_and(|j| j.status == JobStatus::Working) {
            if let Err(e) = self.write_job_status(Some(JobStatus::Working), JobStatus::Queued, None) {
                warn!(task = self.id, job = %self.job_id, error = %e, "failed to requeue job");
            }
        }

        let delay = self.client.config().release_delay;
        self.client.queue().release(self.id, delay).await?;
        info!(task = self.id, job = %self.job_id, ?delay, "task released");
        Ok(())
    }

    /// Remove the task from the queue for good.
    pub async fn delete(&self) -> QueueResult<()> {
        self.client.queue().delete(self.id).await?;
        debug!(task = self.id, job = %self.job_id, "task deleted");
        Ok(())
    }

    /// Mark the job as being worked on.
    pub fn start(&mut self) -> QueueResult<()> {
        self.set_job_status(JobStatus::Working, None)
    }

    /// Record the job's outcome.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> QueueResult<()> {
        self.set_job_status(status, error)?;
        info!(task = self.id, job = %self.job_id, %status, "job finished");
        Ok(())
    }

    /// Write a job status, refreshing and retrying on `Conflict`.
    fn set_job_status(&mut self, status: JobStatus, error: Option<String>) -> QueueResult<()> {
        self.write_job_status(None, status, error)
    }

    /// Like `set_job_status`, but when `only_from` is set a refreshed job
    /// whose status moved elsewhere is left as it is.
    fn write_job_status(
        &mut self,
        only_from: Option<JobStatus>,
        status: JobStatus,
        error: Option<String>,
    ) -> QueueResult<()> {
        let ttl = self.client.config().job_ttl;
        let job = self.job.as_mut().ok_or(QueueError::MissingJob)?;

        let mut attempt = 0;
        loop {
            job.status = status;
            job.error = error.clone();
            match job.save(ttl) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt + 1 < STATUS_RETRIES => {
                    attempt += 1;
                    debug!(job = %job.id, attempt, "job status conflict, refreshing");
                    job.refresh()?;
                    if only_from.is_some_and(|from| job.status != from) {
                        debug!(job = %job.id, status = %job.status, "job status changed elsewhere, keeping it");
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .field("job", &self.job)
            .field("guest", &self.guest.as_ref().map(|g| &g.id))
            .finish()
    }
}
