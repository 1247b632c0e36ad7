//! Job definitions for the CSV pipeline
//!
//! Payloads travel through the queue as JSON with camelCase keys and
//! timestamps in epoch milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transform::SourceRow;

/// Queue holding one job per uploaded file
pub const SPLITTER_QUEUE: &str = "csv-splitter";
/// Queue holding one job per batch of rows
pub const INSERTION_QUEUE: &str = "db-insertion";
/// Job name used for [`SplitJob`]s
pub const SPLIT_JOB_NAME: &str = "split-csv";
/// Job name used for [`InsertJob`]s
pub const INSERT_JOB_NAME: &str = "insert-batch";

/// File identity carried by every batch of that file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub original_file_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_timestamp: DateTime<Utc>,
}

/// Request to split an uploaded file into batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitJob {
    /// Location of the stored upload
    pub file_path: PathBuf,
    /// Name the client uploaded the file under
    pub original_file_name: String,
    /// When the upload was accepted
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_timestamp: DateTime<Utc>,
}

impl SplitJob {
    /// Create a split job stamped with the current time
    pub fn new(file_path: impl Into<PathBuf>, original_file_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            original_file_name: original_file_name.into(),
            start_timestamp: Utc::now(),
        }
    }

    pub fn metadata(&self) -> BatchMetadata {
        BatchMetadata {
            original_file_name: self.original_file_name.clone(),
            start_timestamp: self.start_timestamp,
        }
    }
}

/// One batch of rows to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertJob {
    pub rows: Vec<SourceRow>,
    pub original_file_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_timestamp: DateTime<Utc>,
    /// Set on the last batch of a file only
    pub is_terminal: bool,
}

impl InsertJob {
    pub fn new(rows: Vec<SourceRow>, metadata: &BatchMetadata, is_terminal: bool) -> Self {
        Self {
            rows,
            original_file_name: metadata.original_file_name.clone(),
            start_timestamp: metadata.start_timestamp,
            is_terminal,
        }
    }
}

/// Emitted when the terminal batch of a file has been processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCompletion {
    pub original_file_name: String,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

impl FileCompletion {
    /// Completion for a file that started at `started_at`, finishing now
    pub fn since(original_file_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).to_std().unwrap_or(Duration::ZERO);

        Self {
            original_file_name: original_file_name.into(),
            duration,
            completed_at,
        }
    }
}

/// Result of a successful split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSummary {
    pub original_file_name: String,
    pub total_rows: u64,
    pub batches_submitted: u64,
}
