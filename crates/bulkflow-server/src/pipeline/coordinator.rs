//! Wires the splitter and inserter onto their queues

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::broadcast;

use super::config::{BrokerKind, PipelineConfig};
use super::inserter::BatchInserter;
use super::jobs::{
    FileCompletion, InsertJob, SplitJob, INSERTION_QUEUE, SPLITTER_QUEUE, SPLIT_JOB_NAME,
};
use super::queue::{
    Broker, JobId, MemoryBackend, PostgresBackend, Queue, QueueCounts, QueueEvent, QueueResult,
    WorkerHandle,
};
use super::sink::RecordSink;
use super::splitter::BatchSplitter;

/// Build the broker selected by `config`
pub fn build_broker(config: &PipelineConfig, pool: &PgPool) -> Broker {
    let broker = match config.broker {
        BrokerKind::Postgres => Broker::new(Arc::new(
            PostgresBackend::new(pool.clone()).with_stall_timeout(config.stall_timeout()),
        )),
        BrokerKind::Memory => Broker::new(Arc::new(MemoryBackend::new())),
    };

    broker.with_poll_interval(config.poll_interval())
}

/// Job counts for both pipeline queues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounts {
    pub splitter: QueueCounts,
    pub insertion: QueueCounts,
}

/// Cloneable access to the running pipeline for producers and observers
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    broker: Broker,
    splitter_queue: Queue<SplitJob>,
    insertion_queue: Queue<InsertJob>,
    inserter: Arc<BatchInserter>,
}

impl PipelineHandle {
    /// Submit a stored upload for splitting
    pub async fn enqueue_file(
        &self,
        path: impl Into<PathBuf>,
        original_name: impl Into<String>,
    ) -> QueueResult<JobId> {
        let job = SplitJob::new(path, original_name);
        let job_id = self.splitter_queue.add(SPLIT_JOB_NAME, &job).await?;

        tracing::info!(
            job_id = %job_id,
            file = %job.original_file_name,
            path = %job.file_path.display(),
            "Queued file for splitting"
        );
        Ok(job_id)
    }

    pub fn completions(&self) -> broadcast::Receiver<FileCompletion> {
        self.inserter.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.broker.subscribe()
    }

    pub async fn queue_counts(&self) -> QueueResult<PipelineCounts> {
        Ok(PipelineCounts {
            splitter: self.splitter_queue.counts().await?,
            insertion: self.insertion_queue.counts().await?,
        })
    }
}

/// Owns both pipeline queues and their running workers
#[derive(Debug)]
pub struct PipelineCoordinator {
    handle: PipelineHandle,
    splitter_worker: WorkerHandle,
    insertion_worker: WorkerHandle,
}

impl PipelineCoordinator {
    /// Create both queues on `broker` and start their workers
    pub fn start(broker: Broker, sink: Arc<dyn RecordSink>, config: &PipelineConfig) -> Self {
        let options = config.job_options();
        let splitter_queue = broker.queue::<SplitJob>(SPLITTER_QUEUE, options.clone());
        let insertion_queue = broker.queue::<InsertJob>(INSERTION_QUEUE, options);

        let splitter = Arc::new(BatchSplitter::new(insertion_queue.clone(), config.batch_size));
        let inserter = Arc::new(BatchInserter::new(sink));

        let splitter_worker = splitter_queue.process(splitter, config.splitter_concurrency);
        let insertion_worker = insertion_queue.process(inserter.clone(), config.insertion_concurrency);

        tracing::info!(
            batch_size = config.batch_size,
            splitter_concurrency = config.splitter_concurrency,
            insertion_concurrency = config.insertion_concurrency,
            attempts = config.job_attempts,
            "Pipeline started"
        );

        Self {
            handle: PipelineHandle {
                broker,
                splitter_queue,
                insertion_queue,
                inserter,
            },
            splitter_worker,
            insertion_worker,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub async fn enqueue_file(
        &self,
        path: impl Into<PathBuf>,
        original_name: impl Into<String>,
    ) -> QueueResult<JobId> {
        self.handle.enqueue_file(path, original_name).await
    }

    pub fn completions(&self) -> broadcast::Receiver<FileCompletion> {
        self.handle.completions()
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.handle.events()
    }

    pub async fn queue_counts(&self) -> QueueResult<PipelineCounts> {
        self.handle.queue_counts().await
    }

    /// Stop both workers, letting in-flight jobs finish
    ///
    /// The splitter stops first so the batches it is still producing reach
    /// the insertion queue before that worker drains.
    pub async fn shutdown(self) {
        tracing::info!("Stopping pipeline workers");
        self.splitter_worker.shutdown().await;
        self.insertion_worker.shutdown().await;
        tracing::info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_broker() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        let config = PipelineConfig {
            broker: BrokerKind::Memory,
            poll_interval_ms: 10,
            ..PipelineConfig::default()
        };

        let broker = build_broker(&config, &pool);
        assert_eq!(broker.poll_interval(), std::time::Duration::from_millis(10));
    }
}
