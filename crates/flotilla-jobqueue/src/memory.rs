//! MemoryQueue — in-process tube queue for standalone runs and tests.
//!
//! Tasks live in a single map guarded by a tokio mutex. Every mutation bumps
//! a `watch` generation counter; blocked reservers subscribe to it before
//! inspecting the map, so a put or release between the check and the wait
//! is never missed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::tube::{Reservation, TaskId, TubeQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Ready,
    /// Ready again at the given instant.
    Delayed(Instant),
    /// Reserved until the given instant.
    Reserved(Instant),
}

#[derive(Debug)]
struct Entry {
    tube: String,
    body: String,
    /// FIFO position within the tube.
    seq: u64,
    state: EntryState,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: TaskId,
    next_seq: u64,
    entries: BTreeMap<TaskId, Entry>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Make delayed and timed-out tasks ready again.
    fn promote(&mut self, now: Instant) {
        for (id, entry) in self.entries.iter_mut() {
            match entry.state {
                EntryState::Delayed(at) if at <= now => entry.state = EntryState::Ready,
                EntryState::Reserved(until) if until <= now => {
                    debug!(task = id, tube = %entry.tube, "reservation timed out");
                    entry.state = EntryState::Ready;
                }
                _ => {}
            }
        }
    }

    fn first_ready(&self, tube: &str) -> Option<TaskId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.tube == tube && e.state == EntryState::Ready)
            .min_by_key(|(_, e)| e.seq)
            .map(|(id, _)| *id)
    }

    /// Earliest instant at which a task on `tube` may become ready.
    fn next_wake(&self, tube: &str) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.tube == tube)
            .filter_map(|e| match e.state {
                EntryState::Delayed(at) | EntryState::Reserved(at) => Some(at),
                EntryState::Ready => None,
            })
            .min()
    }
}

/// Per-tube task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TubeStats {
    pub ready: usize,
    pub delayed: usize,
    pub reserved: usize,
}

/// In-process [`TubeQueue`].
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    generation: watch::Sender<u64>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            generation,
        }
    }

    /// Task counts for `tube` as of now.
    pub async fn stats(&self, tube: &str) -> TubeStats {
        let mut inner = self.inner.lock().await;
        inner.promote(Instant::now());
        let mut stats = TubeStats::default();
        for entry in inner.entries.values().filter(|e| e.tube == tube) {
            match entry.state {
                EntryState::Ready => stats.ready += 1,
                EntryState::Delayed(_) => stats.delayed += 1,
                EntryState::Reserved(_) => stats.reserved += 1,
            }
        }
        stats
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

#[async_trait]
impl TubeQueue for MemoryQueue {
    async fn put(&self, tube: &str, body: &str) -> QueueResult<TaskId> {
        let id = {
            let mut inner = self.inner.lock().await;
            inner.next_id += 1;
            let id = inner.next_id;
            let seq = inner.next_seq();
            inner.entries.insert(
                id,
                Entry {
                    tube: tube.to_string(),
                    body: body.to_string(),
                    seq,
                    state: EntryState::Ready,
                },
            );
            id
        };
        self.bump();
        debug!(task = id, %tube, "task put");
        Ok(id)
    }

    async fn reserve(&self, tube: &str, ttr: Duration) -> QueueResult<Reservation> {
        loop {
            let mut changed = self.generation.subscribe();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.promote(now);

                if let Some(id) = inner.first_ready(tube) {
                    if let Some(entry) = inner.entries.get_mut(&id) {
                        entry.state = EntryState::Reserved(now + ttr);
                        debug!(task = id, %tube, ?ttr, "task reserved");
                        return Ok(Reservation {
                            id,
                            body: entry.body.clone(),
                        });
                    }
                }
                inner.next_wake(tube)
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        res = changed.changed() => {
                            res.map_err(|_| QueueError::Unavailable("queue shut down".into()))?;
                        }
                    }
                }
                None => {
                    changed
                        .changed()
                        .await
                        .map_err(|_| QueueError::Unavailable("queue shut down".into()))?;
                }
            }
        }
    }

    async fn delete(&self, id: TaskId) -> QueueResult<()> {
        let removed = self.inner.lock().await.entries.remove(&id);
        match removed {
            Some(entry) => {
                self.bump();
                debug!(task = id, tube = %entry.tube, "task deleted");
                Ok(())
            }
            None => Err(QueueError::TaskNotFound(id)),
        }
    }

    async fn release(&self, id: TaskId, delay: Duration) -> QueueResult<()> {
        {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_seq();
            let entry = inner
                .entries
                .get_mut(&id)
                .ok_or(QueueError::TaskNotFound(id))?;
            entry.seq = seq;
            entry.state = if delay.is_zero() {
                EntryState::Ready
            } else {
                EntryState::Delayed(Instant::now() + delay)
            };
            debug!(task = id, tube = %entry.tube, ?delay, "task released");
        }
        self.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTR: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn reserve_is_fifo_per_tube() {
        let q = MemoryQueue::new();
        let a = q.put("work", "a").await.unwrap();
        let _ = q.put("create", "x").await.unwrap();
        let b = q.put("work", "b").await.unwrap();

        assert_eq!(q.reserve("work", TTR).await.unwrap(), Reservation { id: a, body: "a".into() });
        assert_eq!(q.reserve("work", TTR).await.unwrap().id, b);
        assert_eq!(q.reserve("create", TTR).await.unwrap().body, "x");
    }

    #[tokio::test]
    async fn reserved_task_is_invisible() {
        let q = MemoryQueue::new();
        q.put("work", "a").await.unwrap();
        q.reserve("work", TTR).await.unwrap();

        let second = tokio::time::timeout(Duration::from_millis(100), q.reserve("work", TTR)).await;
        assert!(second.is_err());
        assert_eq!(q.stats("work").await, TubeStats { ready: 0, delayed: 0, reserved: 1 });
    }

    #[tokio::test]
    async fn release_redelivers_same_id() {
        let q = MemoryQueue::new();
        let id = q.put("work", "a").await.unwrap();
        let first = q.reserve("work", TTR).await.unwrap();
        q.release(first.id, Duration::ZERO).await.unwrap();

        let again = q.reserve("work", TTR).await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.body, "a");
    }

    #[tokio::test]
    async fn release_delay_is_honored() {
        let q = MemoryQueue::new();
        q.put("work", "a").await.unwrap();
        let r = q.reserve("work", TTR).await.unwrap();
        q.release(r.id, Duration::from_millis(200)).await.unwrap();
        assert_eq!(q.stats("work").await.delayed, 1);

        let start = std::time::Instant::now();
        let again = q.reserve("work", TTR).await.unwrap();
        assert_eq!(again.id, r.id);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn expired_reservation_is_redelivered() {
        let q = MemoryQueue::new();
        let id = q.put("work", "a").await.unwrap();
        q.reserve("work", Duration::from_millis(100)).await.unwrap();

        let again = tokio::time::timeout(Duration::from_secs(2), q.reserve("work", TTR))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn blocked_reserver_wakes_on_put() {
        let q = Arc::new(MemoryQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.reserve("create", TTR).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = q.put("create", "job-1").await.unwrap();

        let r = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(r.id, id);
    }

    #[tokio::test]
    async fn deleted_task_is_gone() {
        let q = MemoryQueue::new();
        q.put("work", "a").await.unwrap();
        let r = q.reserve("work", TTR).await.unwrap();
        q.delete(r.id).await.unwrap();

        assert!(matches!(q.delete(r.id).await, Err(QueueError::TaskNotFound(_))));
        assert!(matches!(
            q.release(r.id, Duration::ZERO).await,
            Err(QueueError::TaskNotFound(_))
        ));
        assert_eq!(q.stats("work").await, TubeStats::default());
    }
}
