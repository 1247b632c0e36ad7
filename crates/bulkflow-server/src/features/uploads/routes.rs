use std::path::Path;

use axum::{
    extract::{
        multipart::{Field, MultipartError},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::io::AsyncWriteExt;

use super::commands::upload::{stored_path_for, validate_filename};
use super::commands::{UploadCsvCommand, UploadCsvError};
use super::UploadState;
use crate::error::AppError;

pub fn uploads_routes() -> Router<UploadState> {
    Router::new().route("/upload", post(upload_csv))
}

#[tracing::instrument(skip(state, multipart))]
async fn upload_csv(
    State(state): State<UploadState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let command = receive_upload(&state.upload_dir, multipart).await?;
    let stored_path = command.stored_path.clone();

    match super::commands::upload::handle(&state.pipeline, command).await {
        Ok(response) => {
            tracing::info!(
                file = %response.file,
                path = %stored_path.display(),
                "File uploaded, processing started"
            );
            Ok((StatusCode::OK, Json(response)).into_response())
        },
        Err(e) => {
            discard(&stored_path).await;
            Err(e.into())
        },
    }
}

/// Stream the first `file` field of `multipart` into the upload directory
async fn receive_upload(
    upload_dir: &Path,
    mut multipart: Multipart,
) -> Result<UploadCsvCommand, UploadCsvError> {
    let mut received: Option<UploadCsvCommand> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                if let Some(command) = &received {
                    discard(&command.stored_path).await;
                }
                return Err(multipart_error(e));
            },
        };

        if field.name() != Some("file") || received.is_some() {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_string();
        validate_filename(&original_name)?;

        let stored_path = stored_path_for(upload_dir);
        match write_field(field, &stored_path).await {
            Ok(size) => {
                received = Some(UploadCsvCommand {
                    original_name,
                    stored_path,
                    size,
                });
            },
            Err(e) => {
                discard(&stored_path).await;
                return Err(e);
            },
        }
    }

    received.ok_or(UploadCsvError::FileRequired)
}

async fn write_field(mut field: Field<'_>, path: &Path) -> Result<u64, UploadCsvError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size: u64 = 0;

    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(size)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove rejected upload");
        }
    }
}

fn multipart_error(err: MultipartError) -> UploadCsvError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadCsvError::TooLarge
    } else {
        UploadCsvError::Multipart(err.body_text())
    }
}

impl From<UploadCsvError> for AppError {
    fn from(err: UploadCsvError) -> Self {
        match err {
            UploadCsvError::FileRequired
            | UploadCsvError::FilenameRequired
            | UploadCsvError::FilenameLength
            | UploadCsvError::Multipart(_) => AppError::BadRequest(err.to_string()),
            UploadCsvError::TooLarge => AppError::PayloadTooLarge(err.to_string()),
            UploadCsvError::Storage(e) => AppError::Io(e),
            UploadCsvError::Queue(e) => AppError::Queue(e),
        }
    }
}
