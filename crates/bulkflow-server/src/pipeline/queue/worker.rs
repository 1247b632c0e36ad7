//! Queue worker loop
//!
//! A worker claims jobs while it holds a free concurrency permit, runs each
//! one on its own task and settles the outcome with the backend. Active jobs
//! are kept alive with a heartbeat when the backend asks for one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{duration_ms, Broker, JobError, JobId, QueueEvent, RawJob};

/// A decoded job handed to a [`JobHandler`]
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: JobId,
    pub name: String,
    /// 1-based delivery number
    pub attempt: u32,
    pub data: T,
}

/// Processes jobs of one queue
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle(&self, job: Job<T>) -> Result<(), JobError>;
}

/// Handle to a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop claiming and wait for in-flight jobs to settle
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(queue = %self.queue, error = %e, "Worker task terminated abnormally");
        }
    }
}

pub(crate) fn spawn<T, H>(
    broker: Broker,
    queue: String,
    handler: Arc<H>,
    concurrency: usize,
) -> WorkerHandle
where
    T: DeserializeOwned + Send + 'static,
    H: JobHandler<T>,
{
    let token = CancellationToken::new();
    let task = tokio::spawn(run(
        broker,
        queue.clone(),
        handler,
        concurrency.max(1),
        token.clone(),
    ));

    WorkerHandle { queue, token, task }
}

async fn run<T, H>(
    broker: Broker,
    queue: String,
    handler: Arc<H>,
    concurrency: usize,
    token: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
    H: JobHandler<T>,
{
    tracing::info!(queue = %queue, concurrency, "Worker started");

    let permits = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();
    let poll_interval = broker.poll_interval();

    loop {
        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(&queue, joined);
        }

        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match broker.backend().claim(&queue).await {
            Ok(Some(raw)) => {
                tracing::debug!(
                    queue = %queue,
                    job_id = %raw.id,
                    job_name = %raw.name,
                    attempt = raw.attempts_made,
                    "Claimed job"
                );
                in_flight.spawn(execute(broker.clone(), handler.clone(), raw, permit));
            },
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = broker.backend().wait(&queue, poll_interval) => {},
                }
            },
            Err(e) => {
                drop(permit);
                tracing::error!(queue = %queue, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {},
                }
            },
        }
    }

    tracing::info!(queue = %queue, in_flight = in_flight.len(), "Worker stopping, draining jobs");
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(&queue, joined);
    }
    tracing::info!(queue = %queue, "Worker stopped");
}

fn log_join_error(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(queue = %queue, error = %e, "Job task terminated abnormally");
    }
}

async fn execute<T, H>(broker: Broker, handler: Arc<H>, raw: RawJob, _permit: OwnedSemaphorePermit)
where
    T: DeserializeOwned + Send + 'static,
    H: JobHandler<T>,
{
    let heartbeat = broker
        .backend()
        .heartbeat_interval()
        .map(|every| start_heartbeat_task(&broker, raw.clone(), every));

    let outcome = match serde_json::from_value::<T>(raw.payload.clone()) {
        Ok(data) => {
            let job = Job {
                id: raw.id,
                name: raw.name.clone(),
                attempt: raw.attempts_made,
                data,
            };
            match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(JobError::retryable(anyhow::anyhow!("job handler panicked"))),
            }
        },
        Err(e) => Err(JobError::permanent(
            anyhow::Error::new(e).context("undecodable job payload"),
        )),
    };

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    settle(&broker, &raw, outcome).await;
}

fn start_heartbeat_task(broker: &Broker, raw: RawJob, every: Duration) -> JoinHandle<()> {
    let backend = broker.backend().clone();

    tokio::spawn(async move {
        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        timer.tick().await;

        loop {
            timer.tick().await;
            if let Err(e) = backend.heartbeat(&raw).await {
                tracing::warn!(job_id = %raw.id, queue = %raw.queue, error = %e, "Heartbeat failed");
            }
        }
    })
}

async fn settle(broker: &Broker, raw: &RawJob, outcome: Result<(), JobError>) {
    let backend = broker.backend();

    match outcome {
        Ok(()) => {
            if let Err(e) = backend.complete(raw).await {
                tracing::error!(job_id = %raw.id, queue = %raw.queue, error = %e, "Failed to mark job completed");
                return;
            }
            tracing::debug!(job_id = %raw.id, queue = %raw.queue, job_name = %raw.name, "Job completed");
            broker.publish(QueueEvent::Completed {
                queue: raw.queue.clone(),
                job_id: raw.id,
                name: raw.name.clone(),
                attempts: raw.attempts_made,
            });
        },
        Err(err) if err.is_retryable() && raw.attempts_made < raw.options.attempts => {
            let delay = raw.options.backoff.delay_for(raw.attempts_made);
            let message = err.to_string();
            tracing::warn!(
                job_id = %raw.id,
                queue = %raw.queue,
                job_name = %raw.name,
                attempt = raw.attempts_made,
                max_attempts = raw.options.attempts,
                delay_ms = duration_ms(delay),
                error = %message,
                "Job failed, will retry"
            );
            if let Err(e) = backend.retry(raw, delay, &message).await {
                tracing::error!(job_id = %raw.id, queue = %raw.queue, error = %e, "Failed to reschedule job");
                return;
            }
            broker.publish(QueueEvent::Retrying {
                queue: raw.queue.clone(),
                job_id: raw.id,
                name: raw.name.clone(),
                attempt: raw.attempts_made,
                delay,
                error: message,
            });
        },
        Err(err) => {
            let message = err.to_string();
            if err.is_retryable() {
                tracing::error!(
                    job_id = %raw.id,
                    queue = %raw.queue,
                    job_name = %raw.name,
                    attempts = raw.attempts_made,
                    error = %message,
                    "Job failed after max retries"
                );
            } else {
                tracing::error!(
                    job_id = %raw.id,
                    queue = %raw.queue,
                    job_name = %raw.name,
                    attempts = raw.attempts_made,
                    error = %message,
                    "Job failed permanently"
                );
            }
            if let Err(e) = backend.fail(raw, &message).await {
                tracing::error!(job_id = %raw.id, queue = %raw.queue, error = %e, "Failed to mark job failed");
                return;
            }
            broker.publish(QueueEvent::Failed {
                queue: raw.queue.clone(),
                job_id: raw.id,
                name: raw.name.clone(),
                attempts: raw.attempts_made,
                error: message,
            });
        },
    }
}
