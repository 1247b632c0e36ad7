//! Named work queues with at-least-once delivery
//!
//! A [`Broker`] owns a [`QueueBackend`] and a channel of [`QueueEvent`]s.
//! Producers and consumers talk to it through typed [`Queue`] handles:
//!
//! ```no_run
//! # use bulkflow_server::pipeline::queue::{Broker, JobOptions};
//! # async fn demo() -> anyhow::Result<()> {
//! let broker = Broker::in_memory();
//! let queue = broker.queue::<serde_json::Value>("reports", JobOptions::default());
//! queue.add("build-report", &serde_json::json!({ "id": 7 })).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Delivery semantics shared by every backend:
//!
//! - a job is handed to at most `concurrency` handlers of a worker at once
//! - a handler returning a retryable [`JobError`] gets the job redelivered until
//!   `attempts` deliveries have been made, waiting [`Backoff::delay_for`] in between
//! - a permanent error, or running out of attempts, marks the job failed and
//!   emits [`QueueEvent::Failed`]
//! - there is no ordering guarantee between jobs once more than one handler runs

pub mod memory;
pub mod postgres;
pub mod worker;

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
pub use worker::{Job, JobHandler, WorkerHandle};

/// Identifier assigned to a job when it is submitted
pub type JobId = Uuid;

/// Default pause between claim attempts on an idle queue
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Errors raised by queue backends
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {0} is not active")]
    NotActive(JobId),

    #[error("Invalid job row: {0}")]
    InvalidRow(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// How a handler failure should be treated by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    /// Redeliver according to the job's retry policy
    Retryable,
    /// Fail the job now, regardless of remaining attempts
    Permanent,
}

/// Failure returned by a [`JobHandler`]
#[derive(Debug, Error)]
#[error("{source:#}")]
pub struct JobError {
    kind: JobErrorKind,
    source: anyhow::Error,
}

impl JobError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: JobErrorKind::Retryable,
            source: err.into(),
        }
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: JobErrorKind::Permanent,
            source: err.into(),
        }
    }

    pub fn kind(&self) -> JobErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == JobErrorKind::Retryable
    }
}

/// Shape of the delay between deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown backoff kind: {other}")),
        }
    }
}

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay before redelivery after `attempts_made` deliveries have failed
    ///
    /// Exponential backoff doubles per attempt: `delay * 2^(attempts_made - 1)`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                self.delay.saturating_mul(1u32 << exponent)
            },
        }
    }
}

/// Per-job delivery policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total deliveries allowed, including the first one
    pub attempts: u32,
    pub backoff: Backoff,
    /// Drop the job record once it completes
    pub remove_on_complete: bool,
    /// Number of most recent failed jobs kept per queue
    pub remove_on_fail: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(1000)),
            remove_on_complete: true,
            remove_on_fail: 1000,
        }
    }
}

/// A job as stored by a backend, payload still encoded
#[derive(Debug, Clone, PartialEq)]
pub struct RawJob {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    /// Deliveries made so far, including the one in progress
    pub attempts_made: u32,
}

/// Number of jobs per state in one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Observation published by workers as jobs settle
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed {
        queue: String,
        job_id: JobId,
        name: String,
        attempts: u32,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        name: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        queue: String,
        job_id: JobId,
        name: String,
        attempts: u32,
        error: String,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Completed { queue, .. }
            | QueueEvent::Retrying { queue, .. }
            | QueueEvent::Failed { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Completed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Storage and scheduling primitives a broker needs
///
/// Implementations must make `claim` atomic: a job returned by one call is not
/// returned again until it is retried or its worker stops heartbeating.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    async fn push(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> QueueResult<JobId>;

    /// Take the next ready job and count the delivery
    async fn claim(&self, queue: &str) -> QueueResult<Option<RawJob>>;

    async fn complete(&self, job: &RawJob) -> QueueResult<()>;

    /// Put the job back, claimable again after `delay`
    async fn retry(&self, job: &RawJob, delay: Duration, error: &str) -> QueueResult<()>;

    async fn fail(&self, job: &RawJob, error: &str) -> QueueResult<()>;

    /// Wait until `queue` may have a claimable job, at most `timeout`
    async fn wait(&self, queue: &str, timeout: Duration);

    async fn counts(&self, queue: &str) -> QueueResult<QueueCounts>;

    /// Interval at which workers must call [`QueueBackend::heartbeat`] for active jobs
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }

    async fn heartbeat(&self, _job: &RawJob) -> QueueResult<()> {
        Ok(())
    }
}

/// Shared handle to a queue backend
#[derive(Clone)]
pub struct Broker {
    backend: Arc<dyn QueueBackend>,
    events: broadcast::Sender<QueueEvent>,
    poll_interval: Duration,
}

impl Broker {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Broker over a fresh [`MemoryBackend`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Typed handle to the queue called `name`
    pub fn queue<T>(&self, name: impl Into<String>, options: JobOptions) -> Queue<T> {
        Queue {
            broker: self.clone(),
            name: Arc::from(name.into()),
            options,
            _marker: PhantomData,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub async fn submit(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> QueueResult<JobId> {
        self.backend.push(queue, name, payload, options).await
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Typed producer/consumer handle for one named queue
pub struct Queue<T> {
    broker: Broker,
    name: Arc<str>,
    options: JobOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            name: self.name.clone(),
            options: self.options.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Enqueue `data` with the queue's default options
    pub async fn add(&self, job_name: &str, data: &T) -> QueueResult<JobId> {
        self.add_with_options(job_name, data, &self.options).await
    }

    pub async fn add_with_options(
        &self,
        job_name: &str,
        data: &T,
        options: &JobOptions,
    ) -> QueueResult<JobId> {
        let payload = serde_json::to_value(data)?;
        self.broker.submit(&self.name, job_name, payload, options).await
    }

    /// Start a worker running `handler` with at most `concurrency` jobs in flight
    pub fn process<H>(&self, handler: Arc<H>, concurrency: usize) -> WorkerHandle
    where
        H: JobHandler<T>,
    {
        worker::spawn(self.broker.clone(), self.name.to_string(), handler, concurrency)
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.broker.backend.counts(&self.name).await
    }
}
