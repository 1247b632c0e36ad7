//! CSV upload endpoint
//!
//! Streams the `file` field of a multipart request to the upload directory and
//! queues it for splitting.

pub mod commands;
pub mod routes;

use std::path::PathBuf;

use crate::pipeline::PipelineHandle;

pub use commands::{UploadCsvCommand, UploadCsvError, UploadCsvResponse};
pub use routes::uploads_routes;

#[derive(Debug, Clone)]
pub struct UploadState {
    pub upload_dir: PathBuf,
    pub pipeline: PipelineHandle,
}
