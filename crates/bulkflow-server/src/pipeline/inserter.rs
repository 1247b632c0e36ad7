//! Persists insertion batches and reports finished files

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::PipelineResult;
use super::jobs::{FileCompletion, InsertJob};
use super::queue::{duration_ms, Job, JobError, JobHandler};
use super::sink::RecordSink;
use super::transform::{transform, StorageRecord};

const COMPLETION_CHANNEL_CAPACITY: usize = 256;

/// Writes each batch to a [`RecordSink`] in one call
///
/// When the terminal batch of a file is processed a [`FileCompletion`] is
/// logged and broadcast. That happens as soon as the terminal batch is done,
/// even if sibling batches of the same file are still in flight.
pub struct BatchInserter {
    sink: Arc<dyn RecordSink>,
    completions: broadcast::Sender<FileCompletion>,
}

impl BatchInserter {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self { sink, completions }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileCompletion> {
        self.completions.subscribe()
    }

    pub async fn insert_batch(&self, job: &InsertJob) -> PipelineResult<Option<FileCompletion>> {
        if !job.rows.is_empty() {
            let records: Vec<StorageRecord> = job.rows.iter().map(transform).collect();
            let inserted = self.sink.insert_batch(&records).await?;

            tracing::debug!(
                file = %job.original_file_name,
                rows = records.len(),
                inserted,
                "Inserted batch"
            );
        }

        if !job.is_terminal {
            return Ok(None);
        }

        let completion = FileCompletion::since(&job.original_file_name, job.start_timestamp);
        tracing::info!(
            file = %completion.original_file_name,
            duration_ms = duration_ms(completion.duration),
            "Finished processing file in {:.2}s",
            completion.duration.as_secs_f64()
        );
        // No subscribers is fine.
        let _ = self.completions.send(completion.clone());

        Ok(Some(completion))
    }
}

impl std::fmt::Debug for BatchInserter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInserter")
            .field("subscribers", &self.completions.receiver_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobHandler<InsertJob> for BatchInserter {
    async fn handle(&self, job: Job<InsertJob>) -> Result<(), JobError> {
        self.insert_batch(&job.data).await?;
        Ok(())
    }
}
