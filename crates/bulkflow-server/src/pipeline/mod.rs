//! CSV ingestion pipeline
//!
//! Uploaded files flow through two queues:
//!
//! ```text
//! upload -> csv-splitter -> BatchSplitter -> db-insertion -> BatchInserter -> records
//! ```
//!
//! The splitter streams each file into fixed-size batches, tagging the last
//! one as terminal. The inserter writes batches concurrently and reports a
//! [`jobs::FileCompletion`] when it processes a terminal batch.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod inserter;
pub mod jobs;
pub mod queue;
pub mod sink;
pub mod splitter;
pub mod transform;

pub use config::{BrokerKind, PipelineConfig};
pub use coordinator::{build_broker, PipelineCoordinator, PipelineCounts, PipelineHandle};
pub use error::{PipelineError, PipelineResult};
pub use inserter::BatchInserter;
pub use jobs::{BatchMetadata, FileCompletion, InsertJob, SplitJob, SplitSummary};
pub use sink::{PgRecordSink, RecordSink, SinkError};
pub use splitter::BatchSplitter;
pub use transform::{missing_fields, transform, SourceRow, StorageRecord};
