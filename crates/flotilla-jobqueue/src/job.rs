//! Job — the durable record behind a task.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flotilla_core::record::{self, Entity, RecordMeta};
use flotilla_core::{Context, Result};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Working,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(default)]
    pub guest: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An action requested for a guest.
#[derive(Debug, Clone)]
pub struct Job {
    meta: RecordMeta,
    pub id: String,
    /// ID of the guest the action applies to.
    pub guest: String,
    pub action: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl Job {
    pub(crate) fn blank(ctx: &Context, id: String) -> Self {
        Self {
            meta: RecordMeta::new(ctx.clone()),
            id,
            guest: String::new(),
            action: String::new(),
            status: JobStatus::Queued,
            error: None,
        }
    }

    pub fn version(&self) -> Option<flotilla_state::Version> {
        self.meta.version()
    }

    /// Reload from the store. A missing record leaves the job unchanged.
    pub fn refresh(&mut self) -> Result<()> {
        record::refresh(self)?;
        Ok(())
    }

    /// Persist the job; every save restarts its `ttl`.
    pub fn save(&mut self, ttl: Duration) -> Result<()> {
        record::save(self, Some(ttl))
    }
}

impl Entity for Job {
    const KIND: &'static str = "jobs";
    type Record = JobRecord;

    fn id(&self) -> &str {
        &self.id
    }

    fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            guest: self.guest.clone(),
            action: self.action.clone(),
            status: self.status,
            error: self.error.clone(),
        }
    }

    fn apply_record(&mut self, record: JobRecord) -> Result<()> {
        self.guest = record.guest;
        self.action = record.action;
        self.status = record.status;
        self.error = record.error;
        Ok(())
    }

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    /// Jobs are flat: `jobs/<id>`.
    fn key(&self) -> String {
        format!("{}/{}", Self::KIND, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::types::new_id;
    use flotilla_state::StateStore;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Working).unwrap(), "\"working\"");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert!(JobStatus::Done.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn job_record_expires() {
        let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
        let mut job = Job::blank(&ctx, new_id());
        job.guest = "g1".into();
        job.action = "select-hypervisor".into();
        job.save(Duration::from_millis(50)).unwrap();

        let key = format!("jobs/{}", job.id);
        let node = ctx.store().get(&key).unwrap().unwrap();
        assert!(node.expires_at_ms.is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert!(ctx.store().get(&key).unwrap().is_none());
    }
}
