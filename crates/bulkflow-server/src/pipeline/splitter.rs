//! Streams uploaded CSV files into insertion batches

use std::path::Path;

use async_trait::async_trait;
use csv_async::AsyncReaderBuilder;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};

use super::error::{PipelineError, PipelineResult};
use super::jobs::{BatchMetadata, InsertJob, SplitJob, SplitSummary, INSERT_JOB_NAME};
use super::queue::{Job, JobError, JobHandler, Queue};
use super::transform::{missing_fields, SourceRow};

/// Default number of rows per insertion batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Reads a CSV file row by row and enqueues fixed-size [`InsertJob`]s
///
/// Every file produces exactly one terminal batch, submitted last, which may
/// be empty. At most `batch_size` rows are held in memory.
#[derive(Debug, Clone)]
pub struct BatchSplitter {
    insertion_queue: Queue<InsertJob>,
    batch_size: usize,
}

impl BatchSplitter {
    pub fn new(insertion_queue: Queue<InsertJob>, batch_size: usize) -> Self {
        Self {
            insertion_queue,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Split the file named by `job`, then delete it
    pub async fn split_file(&self, job: &SplitJob) -> PipelineResult<SplitSummary> {
        tracing::info!(
            file = %job.original_file_name,
            path = %job.file_path.display(),
            "Started processing file"
        );

        let file = File::open(&job.file_path)
            .await
            .map_err(|source| PipelineError::Open {
                path: job.file_path.clone(),
                source,
            })?;

        let summary = self.split_reader(BufReader::new(file), &job.metadata()).await?;
        remove_source_file(&job.file_path).await?;

        tracing::info!(
            file = %summary.original_file_name,
            total_rows = summary.total_rows,
            batches = summary.batches_submitted,
            "Finished splitting file"
        );

        Ok(summary)
    }

    /// Batch the CSV rows read from `reader`
    pub async fn split_reader<R>(&self, reader: R, metadata: &BatchMetadata) -> PipelineResult<SplitSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut csv = AsyncReaderBuilder::new()
            .has_headers(true)
            .create_deserializer(reader);
        let mut rows = csv.deserialize::<SourceRow>();

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut total_rows: u64 = 0;
        let mut batches_submitted: u64 = 0;

        while let Some(row) = rows.next().await {
            let row = row?;

            if total_rows == 0 {
                let missing = missing_fields(&row);
                if !missing.is_empty() {
                    tracing::debug!(
                        file = %metadata.original_file_name,
                        missing = ?missing,
                        "First row lacks expected columns"
                    );
                }
            }

            batch.push(row);
            total_rows += 1;

            if batch.len() >= self.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                self.submit(full, metadata, false).await?;
                batches_submitted += 1;
            }
        }

        self.submit(batch, metadata, true).await?;
        batches_submitted += 1;

        Ok(SplitSummary {
            original_file_name: metadata.original_file_name.clone(),
            total_rows,
            batches_submitted,
        })
    }

    async fn submit(
        &self,
        rows: Vec<SourceRow>,
        metadata: &BatchMetadata,
        is_terminal: bool,
    ) -> PipelineResult<()> {
        let size = rows.len();
        let job = InsertJob::new(rows, metadata, is_terminal);
        let job_id = self.insertion_queue.add(INSERT_JOB_NAME, &job).await?;

        tracing::debug!(
            file = %metadata.original_file_name,
            job_id = %job_id,
            rows = size,
            is_terminal,
            "Submitted batch"
        );
        Ok(())
    }
}

async fn remove_source_file(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Source file already removed");
            Ok(())
        },
        Err(source) => Err(PipelineError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl JobHandler<SplitJob> for BatchSplitter {
    async fn handle(&self, job: Job<SplitJob>) -> Result<(), JobError> {
        self.split_file(&job.data).await?;
        Ok(())
    }
}
