//! Work-queue client.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use flotilla_core::Context;
use flotilla_core::record;
use flotilla_core::types::new_id;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::task::Task;
use crate::tube::{TaskId, TubeQueue};

/// Tube for placement requests.
pub const CREATE_TUBE: &str = "create";
/// Tube for every other guest action.
pub const WORK_TUBE: &str = "work";
/// The action routed to the create tube.
pub const SELECT_HYPERVISOR: &str = "select-hypervisor";

/// Delivery parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a reserved task stays invisible to other consumers.
    pub ttr: Duration,
    /// How long a released task waits before it is ready again.
    pub release_delay: Duration,
    /// Upper bound on a blocking reserve; `None` waits forever.
    pub reserve_timeout: Option<Duration>,
    /// Lifetime of a job record, restarted on every save.
    pub job_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttr: Duration::from_secs(5),
            release_delay: Duration::from_secs(5),
            reserve_timeout: Some(Duration::from_secs(10 * 60 * 60)),
            job_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Client over a [`TubeQueue`] and the coordination store.
#[derive(Clone)]
pub struct Client {
    ctx: Context,
    queue: Arc<dyn TubeQueue>,
    config: QueueConfig,
}

impl Client {
    pub fn new(ctx: Context, queue: Arc<dyn TubeQueue>, config: QueueConfig) -> Self {
        Self { ctx, queue, config }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn queue(&self) -> &Arc<dyn TubeQueue> {
        &self.queue
    }

    /// A new, unsaved job with a fresh ID.
    pub fn new_job(&self) -> Job {
        Job::blank(&self.ctx, new_id())
    }

    /// Load a job by ID.
    pub fn job(&self, id: &str) -> QueueResult<Job> {
        let mut job = Job::blank(&self.ctx, id.to_string());
        if !record::refresh(&mut job)? {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(job)
    }

    /// Tube a job's tasks are delivered through.
    pub fn tube_for(action: &str) -> &'static str {
        if action == SELECT_HYPERVISOR {
            CREATE_TUBE
        } else {
            WORK_TUBE
        }
    }

    /// Enqueue a task for `job`.
    pub async fn add_task(&self, job: &Job) -> QueueResult<TaskId> {
        let tube = Self::tube_for(&job.action);
        let id = self.queue.put(tube, &job.id).await?;
        debug!(task = id, job = %job.id, %tube, "task added");
        Ok(id)
    }

    pub async fn delete_task(&self, id: TaskId) -> QueueResult<()> {
        self.queue.delete(id).await
    }

    /// Create and save a job for `guest_id`, then enqueue its task.
    pub async fn add_job(&self, guest_id: &str, action: &str) -> QueueResult<Job> {
        let mut job = self.new_job();
        job.guest = guest_id.to_string();
        job.action = action.to_string();
        job.save(self.config.job_ttl)?;

        let task = self.add_task(&job).await?;
        info!(job = %job.id, guest = %guest_id, %action, task, "job added");
        Ok(job)
    }

    /// Reserve the next placement task.
    pub async fn next_create_task(&self) -> QueueResult<Task> {
        self.next_task(CREATE_TUBE, None).await
    }

    pub async fn next_create_task_until(&self, deadline: Instant) -> QueueResult<Task> {
        self.next_task(CREATE_TUBE, Some(deadline)).await
    }

    /// Reserve the next non-placement task.
    pub async fn next_work_task(&self) -> QueueResult<Task> {
        self.next_task(WORK_TUBE, None).await
    }

    pub async fn next_work_task_until(&self, deadline: Instant) -> QueueResult<Task> {
        self.next_task(WORK_TUBE, Some(deadline)).await
    }

    /// Reserve from `tube` and load the task's job, then its guest.
    async fn next_task(&self, tube: &str, deadline: Option<Instant>) -> QueueResult<Task> {
        let deadline = deadline.or_else(|| self.config.reserve_timeout.map(|t| Instant::now() + t));
        let reserve = self.queue.reserve(tube, self.config.ttr);

        let reservation = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, reserve)
                .await
                .map_err(|_| QueueError::Timeout(tube.to_string()))??,
            None => reserve.await?,
        };

        let mut task = Task::new(self.clone(), reservation.id, reservation.body);
        if let Err(e) = task.hydrate() {
            return Err(QueueError::Hydration {
                task: Box::new(task),
                source: Box::new(e),
            });
        }
        debug!(task = task.id, job = %task.job_id, %tube, "task reserved");
        Ok(task)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::memory::{MemoryQueue, TubeStats};
    use flotilla_state::StateStore;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            ttr: Duration::from_secs(30),
            release_delay: Duration::ZERO,
            reserve_timeout: Some(Duration::from_secs(5)),
            job_ttl: Duration::from_secs(60),
        }
    }

    fn test_client() -> (Client, Arc<MemoryQueue>) {
        let ctx = Context::new(StateStore::open_in_memory().unwrap().shared());
        let queue = Arc::new(MemoryQueue::new());
        (Client::new(ctx, queue.clone(), fast_config()), queue)
    }

    fn saved_guest(client: &Client) -> String {
        let mut g = client.ctx().new_guest();
        g.flavor_id = "f1".into();
        g.save().unwrap();
        g.id
    }

    #[tokio::test]
    async fn add_job_routes_by_action() {
        let (client, queue) = test_client();
        client.add_job("g1", SELECT_HYPERVISOR).await.unwrap();
        client.add_job("g1", "delete").await.unwrap();
        client.add_job("g1", "start").await.unwrap();

        assert_eq!(queue.stats(CREATE_TUBE).await.ready, 1);
        assert_eq!(queue.stats(WORK_TUBE).await.ready, 2);
    }

    #[tokio::test]
    async fn add_job_saves_queued_record_with_ttl() {
        let (client, _) = test_client();
        let job = client.add_job("g1", SELECT_HYPERVISOR).await.unwrap();

        let loaded = client.job(&job.id).unwrap();
        assert_eq!(loaded.guest, "g1");
        assert_eq!(loaded.status, JobStatus::Queued);
        let node = client.ctx().store().get(&format!("jobs/{}", job.id)).unwrap().unwrap();
        assert!(node.expires_at_ms.is_some());
    }

    #[tokio::test]
    async fn next_task_hydrates_job_and_guest() {
        let (client, _) = test_client();
        let guest_id = saved_guest(&client);
        let job = client.add_job(&guest_id, SELECT_HYPERVISOR).await.unwrap();

        let task = client.next_create_task().await.unwrap();
        assert_eq!(task.job_id, job.id);
        assert_eq!(task.job.as_ref().unwrap().action, SELECT_HYPERVISOR);
        assert_eq!(task.guest.as_ref().unwrap().id, guest_id);
        assert_eq!(task.guest.as_ref().unwrap().flavor_id, "f1");
    }

    #[tokio::test]
    async fn missing_guest_returns_partial_task() {
        let (client, queue) = test_client();
        client.add_job("no-such-guest", "delete").await.unwrap();

        let err = client.next_work_task().await.unwrap_err();
        let QueueError::Hydration { task, source } = err else {
            panic!("expected hydration error");
        };
        assert!(matches!(*source, QueueError::GuestNotFound(_)));
        assert!(task.job.is_some());
        assert!(task.guest.is_none());

        task.delete().await.unwrap();
        assert_eq!(queue.stats(WORK_TUBE).await, TubeStats::default());
    }

    #[tokio::test]
    async fn job_without_guest_is_no_guest() {
        let (client, _) = test_client();
        client.add_job("", "delete").await.unwrap();

        let err = client.next_work_task().await.unwrap_err();
        assert!(err.is_permanent());
        assert!(matches!(
            err,
            QueueError::Hydration { ref source, .. } if matches!(**source, QueueError::NoGuest(_))
        ));
    }

    #[tokio::test]
    async fn unsaved_job_is_job_not_found() {
        let (client, _) = test_client();
        let job = client.new_job();
        client.add_task(&job).await.unwrap();

        let err = client.next_work_task().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Hydration { ref source, .. } if matches!(**source, QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reserve_until_deadline_times_out() {
        let (client, _) = test_client();
        let err = client
            .next_create_task_until(Instant::now() + Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout(ref tube) if tube == CREATE_TUBE));
    }

    #[tokio::test]
    async fn delete_task_by_id() {
        let (client, queue) = test_client();
        let job = client.add_job("g1", "delete").await.unwrap();
        let id = client.add_task(&job).await.unwrap();

        client.delete_task(id).await.unwrap();
        assert_eq!(queue.stats(WORK_TUBE).await.ready, 1);
        assert!(matches!(
            client.delete_task(id).await,
            Err(QueueError::TaskNotFound(_))
        ));
    }
}
