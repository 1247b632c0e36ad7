//! Pipeline error types

use std::path::PathBuf;

use thiserror::Error;

use super::queue::{JobError, QueueError};
use super::sink::SinkError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read CSV: {0}")]
    Csv(#[from] csv_async::Error),

    #[error("Failed to remove {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl From<PipelineError> for JobError {
    /// Pipeline failures are transient from the broker's point of view
    fn from(err: PipelineError) -> Self {
        JobError::retryable(err)
    }
}
