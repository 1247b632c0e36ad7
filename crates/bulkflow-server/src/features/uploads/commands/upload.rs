use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::queue::QueueError;
use crate::pipeline::PipelineHandle;

/// Longest accepted client file name
pub const MAX_FILENAME_LENGTH: usize = 255;

/// A CSV already streamed to the upload directory, ready to be split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCsvCommand {
    pub original_name: String,
    pub stored_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadCsvResponse {
    pub message: String,
    pub file: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadCsvError {
    #[error("No file uploaded")]
    FileRequired,
    #[error("Filename is required and cannot be empty")]
    FilenameRequired,
    #[error("Filename must not exceed 255 characters")]
    FilenameLength,
    #[error("Upload exceeds the size limit")]
    TooLarge,
    #[error("Malformed multipart body: {0}")]
    Multipart(String),
    #[error("Failed to store upload: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Failed to queue upload: {0}")]
    Queue(#[from] QueueError),
}

/// Check a client-supplied file name before anything is written
pub fn validate_filename(name: &str) -> Result<(), UploadCsvError> {
    if name.trim().is_empty() {
        return Err(UploadCsvError::FilenameRequired);
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(UploadCsvError::FilenameLength);
    }
    Ok(())
}

impl UploadCsvCommand {
    pub fn validate(&self) -> Result<(), UploadCsvError> {
        validate_filename(&self.original_name)
    }
}

/// Path a new upload is stored under
pub fn stored_path_for(upload_dir: &Path) -> PathBuf {
    upload_dir.join(format!("{}.csv", uuid::Uuid::new_v4()))
}

#[tracing::instrument(skip(pipeline, command), fields(file = %command.original_name, size = command.size))]
pub async fn handle(
    pipeline: &PipelineHandle,
    command: UploadCsvCommand,
) -> Result<UploadCsvResponse, UploadCsvError> {
    command.validate()?;

    pipeline
        .enqueue_file(command.stored_path.clone(), command.original_name.clone())
        .await?;

    Ok(UploadCsvResponse {
        message: "Processing started".to_string(),
        file: command.original_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> UploadCsvCommand {
        UploadCsvCommand {
            original_name: name.to_string(),
            stored_path: PathBuf::from("uploads/x.csv"),
            size: 10,
        }
    }

    #[test]
    fn test_validation_success() {
        assert!(command("customers-100.csv").validate().is_ok());
    }

    #[test]
    fn test_validation_empty_filename() {
        assert!(matches!(
            command("   ").validate(),
            Err(UploadCsvError::FilenameRequired)
        ));
    }

    #[test]
    fn test_validation_filename_too_long() {
        let name = format!("{}.csv", "a".repeat(MAX_FILENAME_LENGTH));
        assert!(matches!(
            command(&name).validate(),
            Err(UploadCsvError::FilenameLength)
        ));
    }

    #[test]
    fn test_stored_path_is_unique_csv() {
        let dir = Path::new("uploads");
        let first = stored_path_for(dir);
        let second = stored_path_for(dir);

        assert_ne!(first, second);
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("csv"));
        assert!(first.starts_with(dir));
    }
}
