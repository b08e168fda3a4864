//! Scheduler — the consumer loops behind the create and work tubes.
//!
//! Every task is handled at least once: a failure that may clear up later
//! releases the task for redelivery, a failure that never will (job or
//! guest gone, unknown action) marks the job failed and deletes the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flotilla_core::types::new_id;
use flotilla_core::{Context, Error as CoreError, Guest, Hypervisor, Resources, reconcile_all};
use flotilla_jobqueue::{CREATE_TUBE, Client, JobStatus, QueueError, Task, WORK_TUBE};
use flotilla_lock::LockError;
use flotilla_state::Version;

use crate::error::{SchedulerError, SchedulerResult};

/// Work-tube action that destroys a guest.
pub const DELETE_ACTION: &str = "delete";

/// Work-tube actions executed by the hypervisor agent that runs the guest.
/// The scheduler hands them back to the tube untouched.
pub const LIFECYCLE_ACTIONS: [&str; 6] = ["start", "shutdown", "reboot", "restart", "poweroff", "suspend"];

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lease on a hypervisor's placement lock.
    pub lock_ttl: Duration,
    /// Attempts at a hypervisor resource write before giving up on conflicts.
    pub save_retries: usize,
    /// Period of the orphan reconciliation sweep.
    pub reconcile_interval: Duration,
    /// Pause after a failed queue operation.
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            save_retries: 3,
            reconcile_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// What happened to a reserved task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Job done, task deleted.
    Completed,
    /// Task returned to its tube for another attempt.
    Released,
    /// Job failed for good, task deleted.
    Failed(String),
}

/// Places guests and executes guest actions from the work queue.
pub struct Scheduler {
    ctx: Context,
    client: Client,
    config: SchedulerConfig,
    /// Value written into every lock this scheduler takes.
    holder: String,
}

impl Scheduler {
    pub fn new(client: Client, config: SchedulerConfig) -> Self {
        Self {
            ctx: client.ctx().clone(),
            client,
            config,
            holder: format!("scheduler-{}", new_id()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Live hypervisors, in ID order, whose available resources cover `need`.
    pub fn candidates(&self, need: &Resources) -> SchedulerResult<Vec<Hypervisor>> {
        let mut candidates = Vec::new();
        self.ctx.for_each_hypervisor(|hv| {
            if hv.is_alive() && hv.available_resources.covers(need) {
                candidates.push(hv);
            }
            Ok(())
        })?;
        Ok(candidates)
    }

    /// Place `guest` on the first candidate hypervisor that takes it.
    ///
    /// Returns the hypervisor ID. An already placed guest is left alone.
    pub async fn place_guest(&self, guest: &mut Guest) -> SchedulerResult<String> {
        if let Some(p) = guest.placement() {
            return Ok(p.hypervisor_id.clone());
        }
        let need = self.ctx.flavor(&guest.flavor_id)?.resources;

        for candidate in self.candidates(&need)? {
            let lock_name = format!("locks/hypervisors/{}", candidate.id);
            let mut lock = match flotilla_lock::acquire(
                self.ctx.store().clone(),
                &lock_name,
                &self.holder,
                self.config.lock_ttl,
                false,
            )
            .await
            {
                Ok(lock) => lock,
                Err(LockError::AlreadyHeld(_)) => {
                    debug!(hypervisor = %candidate.id, guest = %guest.id, "hypervisor locked, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let placed = self.place_on(candidate, guest, &need);
            if let Err(e) = lock.release() {
                warn!(lock = %lock_name, error = %e, "failed to release hypervisor lock");
            }
            match placed? {
                Some(hypervisor_id) => return Ok(hypervisor_id),
                None => continue,
            }
        }

        Err(SchedulerError::NoHypervisor(guest.id.clone()))
    }

    /// Try one hypervisor while holding its lock. `None` = it cannot take the guest.
    fn place_on(
        &self,
        mut hv: Hypervisor,
        guest: &mut Guest,
        need: &Resources,
    ) -> SchedulerResult<Option<String>> {
        // Re-read under the lock; the listing may be stale.
        hv.refresh()?;
        if !hv.is_alive() || !hv.available_resources.covers(need) {
            return Ok(None);
        }

        match hv.add_guest(guest) {
            Ok(()) => {}
            Err(CoreError::NoSuitableSubnet { .. } | CoreError::NoAvailableAddress(_)) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let charge = *need;
        if let Err(e) = self.adjust_resources(&mut hv, |available, _| available.saturating_sub(&charge)) {
            // The guest is placed; the next heartbeat recomputes resources.
            warn!(hypervisor = %hv.id, guest = %guest.id, error = %e, "failed to charge guest resources");
        }
        Ok(Some(hv.id))
    }

    /// Rewrite `hv`'s available resources, refreshing and retrying on `Conflict`.
    fn adjust_resources<F>(&self, hv: &mut Hypervisor, adjust: F) -> SchedulerResult<()>
    where
        F: Fn(Resources, Resources) -> Resources,
    {
        for attempt in 1..=self.config.save_retries {
            hv.available_resources = adjust(hv.available_resources, hv.total_resources);
            match hv.save() {
                Ok(()) => {
                    debug!(hypervisor = %hv.id, available = ?hv.available_resources, "resources adjusted");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(hypervisor = %hv.id, attempt, "hypervisor record changed, refreshing");
                    hv.refresh()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::ResourceContention(hv.id.clone()))
    }

    // ── Task handling ──────────────────────────────────────────────

    /// Reserve and handle the next create-tube task.
    pub async fn process_next_create(&self) -> SchedulerResult<TaskOutcome> {
        match self.client.next_create_task().await {
            Ok(mut task) => self.handle_create_task(&mut task).await,
            Err(QueueError::Hydration { task, source }) => self.handle_unloadable(*task, *source).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve and handle the next work-tube task.
    pub async fn process_next_work(&self) -> SchedulerResult<TaskOutcome> {
        match self.client.next_work_task().await {
            Ok(mut task) => self.handle_work_task(&mut task).await,
            Err(QueueError::Hydration { task, source }) => self.handle_unloadable(*task, *source).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Place the task's guest.
    pub async fn handle_create_task(&self, task: &mut Task) -> SchedulerResult<TaskOutcome> {
        let Some(mut guest) = task.guest.take() else {
            let reason = QueueError::GuestNotFound(task.job_id.clone()).to_string();
            return self.fail(task, reason).await;
        };

        if guest.is_placed() {
            info!(task = task.id, guest = %guest.id, "guest already placed");
            task.guest = Some(guest);
            return self.complete(task).await;
        }

        task.start()?;
        let placed = self.place_guest(&mut guest).await;
        let guest_id = guest.id.clone();
        task.guest = Some(guest);

        match placed {
            Ok(hypervisor) => {
                info!(task = task.id, guest = %guest_id, %hypervisor, "placement complete");
                self.complete(task).await
            }
            Err(e) => {
                warn!(task = task.id, guest = %guest_id, error = %e, "placement failed, releasing task");
                task.release().await?;
                Ok(TaskOutcome::Released)
            }
        }
    }

    /// Execute the task's guest action.
    pub async fn handle_work_task(&self, task: &mut Task) -> SchedulerResult<TaskOutcome> {
        let action = task
            .job
            .as_ref()
            .map(|job| job.action.clone())
            .unwrap_or_default();

        match action.as_str() {
            DELETE_ACTION => {
                task.start()?;
                match self.delete_guest(task) {
                    Ok(()) => self.complete(task).await,
                    Err(e) => {
                        warn!(task = task.id, error = %e, "guest delete failed, releasing task");
                        task.release().await?;
                        Ok(TaskOutcome::Released)
                    }
                }
            }
            action if LIFECYCLE_ACTIONS.contains(&action) => {
                debug!(task = task.id, %action, "lifecycle action belongs to the hypervisor agent, releasing");
                task.release().await?;
                Ok(TaskOutcome::Released)
            }
            other => {
                let reason = SchedulerError::UnknownAction(other.to_string()).to_string();
                self.fail(task, reason).await
            }
        }
    }

    /// Destroy the task's guest and give its resources back to its hypervisor.
    fn delete_guest(&self, task: &mut Task) -> SchedulerResult<()> {
        let Some(guest) = task.guest.as_mut() else {
            return Err(QueueError::GuestNotFound(task.job_id.clone()).into());
        };
        let hypervisor_id = guest.placement().map(|p| p.hypervisor_id.clone());
        let freed = match self.ctx.flavor(&guest.flavor_id) {
            Ok(flavor) => Some(flavor.resources),
            Err(CoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        guest.destroy()?;

        if let (Some(hypervisor_id), Some(freed)) = (hypervisor_id, freed) {
            match self.ctx.hypervisor(&hypervisor_id) {
                Ok(mut hv) => {
                    let credit = |available: Resources, total: Resources| cap(available + freed, total);
                    if let Err(e) = self.adjust_resources(&mut hv, credit) {
                        warn!(hypervisor = %hypervisor_id, error = %e, "failed to credit guest resources");
                    }
                }
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// A reserved task whose job or guest could not be loaded.
    async fn handle_unloadable(&self, mut task: Task, source: QueueError) -> SchedulerResult<TaskOutcome> {
        if source.is_permanent() {
            warn!(task = task.id, job = %task.job_id, error = %source, "task cannot be loaded, failing job");
            return self.fail(&mut task, source.to_string()).await;
        }
        warn!(task = task.id, job = %task.job_id, error = %source, "task load failed, releasing");
        task.release().await?;
        Ok(TaskOutcome::Released)
    }

    async fn complete(&self, task: &mut Task) -> SchedulerResult<TaskOutcome> {
        task.finish(JobStatus::Done, None)?;
        task.delete().await?;
        Ok(TaskOutcome::Completed)
    }

    async fn fail(&self, task: &mut Task, reason: String) -> SchedulerResult<TaskOutcome> {
        if task.job.is_some() {
            if let Err(e) = task.finish(JobStatus::Failed, Some(reason.clone())) {
                warn!(task = task.id, job = %task.job_id, error = %e, "failed to record job failure");
            }
        }
        task.delete().await?;
        Ok(TaskOutcome::Failed(reason))
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Sweep orphans older than `previous`, returning the next snapshot.
    ///
    /// The first call (no previous snapshot) only takes the snapshot, so
    /// placements in flight during the sweep are never touched.
    pub fn reconcile_once(&self, previous: Option<Version>) -> SchedulerResult<Version> {
        let snapshot = self.ctx.store().current_version()?;
        if let Some(before) = previous {
            let cleaned = reconcile_all(&self.ctx, before)?;
            if cleaned > 0 {
                info!(cleaned, "reconciliation removed orphaned keys");
            }
        }
        Ok(snapshot)
    }

    // ── Loops ──────────────────────────────────────────────────────

    /// Consume the create tube until shutdown.
    pub async fn run_create_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tube = CREATE_TUBE, "consumer loop starting");
        loop {
            let result = tokio::select! {
                result = self.process_next_create() => result,
                _ = shutdown.changed() => break,
            };
            if !self.after_task(CREATE_TUBE, result, &mut shutdown).await {
                break;
            }
        }
        info!(tube = CREATE_TUBE, "consumer loop stopped");
    }

    /// Consume the work tube until shutdown.
    pub async fn run_work_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tube = WORK_TUBE, "consumer loop starting");
        loop {
            let result = tokio::select! {
                result = self.process_next_work() => result,
                _ = shutdown.changed() => break,
            };
            if !self.after_task(WORK_TUBE, result, &mut shutdown).await {
                break;
            }
        }
        info!(tube = WORK_TUBE, "consumer loop stopped");
    }

    /// Run the reconciliation sweep every interval until shutdown.
    pub async fn run_reconcile_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.reconcile_interval, "reconcile loop starting");
        let mut previous = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconcile_interval) => {}
                _ = shutdown.changed() => break,
            }
            match self.reconcile_once(previous) {
                Ok(snapshot) => previous = Some(snapshot),
                Err(e) => error!(error = %e, "reconciliation failed"),
            }
        }
        info!("reconcile loop stopped");
    }

    /// Log a task result; back off after errors. Returns false on shutdown.
    async fn after_task(
        &self,
        tube: &str,
        result: SchedulerResult<TaskOutcome>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        match result {
            Ok(outcome) => {
                debug!(%tube, ?outcome, "task handled");
                true
            }
            Err(SchedulerError::Queue(QueueError::Timeout(_))) => {
                debug!(%tube, "reserve timed out, waiting again");
                true
            }
            Err(e) => {
                error!(%tube, error = %e, "task handling failed");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_backoff) => true,
                    _ = shutdown.changed() => false,
                }
            }
        }
    }
}

/// Clamp each dimension of `value` to `limit`.
fn cap(value: Resources, limit: Resources) -> Resources {
    Resources {
        memory: value.memory.min(limit.memory),
        disk: value.disk.min(limit.disk),
        cpu: value.cpu.min(limit.cpu),
    }
}
