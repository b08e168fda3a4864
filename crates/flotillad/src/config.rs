//! flotillad.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flotilla_core::Resources;
use flotilla_jobqueue::QueueConfig;
use flotilla_scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// How often expired store entries are purged.
    pub sweep_interval_secs: u64,
    pub queue: QueueSection,
    pub scheduler: SchedulerSection,
    /// Present when this daemon also runs on a hypervisor.
    pub hypervisor: Option<HypervisorSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub ttr_secs: u64,
    pub release_delay_secs: u64,
    /// 0 waits forever.
    pub reserve_timeout_secs: u64,
    pub job_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub lock_ttl_secs: u64,
    pub save_retries: usize,
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorSection {
    pub id: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
    /// Total capacity announced on every heartbeat.
    #[serde(default)]
    pub resources: Resources,
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_ttl() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/flotilla"),
            sweep_interval_secs: 30,
            queue: QueueSection::default(),
            scheduler: SchedulerSection::default(),
            hypervisor: None,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            ttr_secs: 5,
            release_delay_secs: 5,
            reserve_timeout_secs: 10 * 60 * 60,
            job_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30,
            save_retries: 3,
            reconcile_interval_secs: 60,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` if given and present, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        let q = &self.queue;
        QueueConfig {
            ttr: Duration::from_secs(q.ttr_secs),
            release_delay: Duration::from_secs(q.release_delay_secs),
            reserve_timeout: (q.reserve_timeout_secs > 0)
                .then(|| Duration::from_secs(q.reserve_timeout_secs)),
            job_ttl: Duration::from_secs(q.job_ttl_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            lock_ttl: Duration::from_secs(s.lock_ttl_secs),
            save_retries: s.save_retries,
            reconcile_interval: Duration::from_secs(s.reconcile_interval_secs),
            ..SchedulerConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/flotilla"));
        assert_eq!(config.queue.ttr_secs, 5);
        assert!(config.hypervisor.is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
data_dir = "/tmp/flotilla"
sweep_interval_secs = 5

[queue]
ttr_secs = 20
reserve_timeout_secs = 0

[scheduler]
save_retries = 7

[hypervisor]
id = "hv-01"
heartbeat_ttl_secs = 15

[hypervisor.resources]
memory = 65536
disk = 2000
cpu = 32
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));

        let queue = config.queue_config();
        assert_eq!(queue.ttr, Duration::from_secs(20));
        assert_eq!(queue.release_delay, Duration::from_secs(5));
        assert!(queue.reserve_timeout.is_none());

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.save_retries, 7);
        assert_eq!(scheduler.lock_ttl, Duration::from_secs(30));

        let hv = config.hypervisor.unwrap();
        assert_eq!(hv.id, "hv-01");
        assert_eq!(hv.heartbeat_interval_secs, 10);
        assert_eq!(hv.heartbeat_ttl_secs, 15);
        assert_eq!(hv.resources, Resources::new(65536, 2000, 32));
    }

    #[test]
    fn test_hypervisor_needs_id() {
        let result: Result<DaemonConfig, _> = toml::from_str("[hypervisor]\nheartbeat_ttl_secs = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.scheduler.lock_ttl_secs, 30);
        assert!(DaemonConfig::load(None).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotillad.toml");
        std::fs::write(&path, "data_dir = \"/srv/fleet\"\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/fleet"));
    }
}
