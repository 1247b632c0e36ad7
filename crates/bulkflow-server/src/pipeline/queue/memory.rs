//! In-process queue backend
//!
//! Jobs live only as long as the process. Used by tests and by single-node
//! deployments that accept losing queued work on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{JobId, JobOptions, QueueBackend, QueueCounts, QueueError, QueueResult, RawJob};

/// A job kept after its final failure
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: RawJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    raw: RawJob,
    run_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<Entry>,
    active: HashMap<JobId, RawJob>,
    completed: u64,
    failed: VecDeque<FailedJob>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn next_run_at(&self) -> Option<Instant> {
        self.waiting.iter().map(|entry| entry.run_at).min()
    }
}

/// Queue backend holding all state in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed jobs retained for `queue`, oldest first
    pub async fn failed_jobs(&self, queue: &str) -> Vec<FailedJob> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.failed.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take_active(state: &mut QueueState, job: &RawJob) -> QueueResult<RawJob> {
        state
            .active
            .remove(&job.id)
            .ok_or(QueueError::NotActive(job.id))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> QueueResult<JobId> {
        let id = Uuid::new_v4();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.waiting.push_back(Entry {
            raw: RawJob {
                id,
                queue: queue.to_string(),
                name: name.to_string(),
                payload,
                options: options.clone(),
                attempts_made: 0,
            },
            run_at: Instant::now(),
        });
        state.notify.notify_one();

        Ok(id)
    }

    async fn claim(&self, queue: &str) -> QueueResult<Option<RawJob>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        let Some(index) = state.waiting.iter().position(|entry| entry.run_at <= now) else {
            return Ok(None);
        };
        let Some(entry) = state.waiting.remove(index) else {
            return Ok(None);
        };

        let mut raw = entry.raw;
        raw.attempts_made += 1;
        state.active.insert(raw.id, raw.clone());

        Ok(Some(raw))
    }

    async fn complete(&self, job: &RawJob) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue.clone()).or_default();
        Self::take_active(state, job)?;
        state.completed += 1;
        Ok(())
    }

    async fn retry(&self, job: &RawJob, delay: Duration, _error: &str) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue.clone()).or_default();
        let raw = Self::take_active(state, job)?;

        state.waiting.push_back(Entry {
            raw,
            run_at: Instant::now() + delay,
        });
        state.notify.notify_one();

        Ok(())
    }

    async fn fail(&self, job: &RawJob, error: &str) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue.clone()).or_default();
        let raw = Self::take_active(state, job)?;
        let keep = raw.options.remove_on_fail;

        state.failed.push_back(FailedJob {
            job: raw,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        while state.failed.len() > keep {
            state.failed.pop_front();
        }

        Ok(())
    }

    async fn wait(&self, queue: &str, timeout: Duration) {
        let (notify, next_run_at) = {
            let mut queues = self.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            (state.notify.clone(), state.next_run_at())
        };

        let mut deadline = Instant::now() + timeout;
        if let Some(run_at) = next_run_at {
            deadline = deadline.min(run_at);
        }

        tokio::select! {
            _ = notify.notified() => {},
            _ = tokio::time::sleep_until(deadline) => {},
        }
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| QueueCounts {
                waiting: state.waiting.len() as u64,
                active: state.active.len() as u64,
                completed: state.completed,
                failed: state.failed.len() as u64,
            })
            .unwrap_or_default())
    }
}
