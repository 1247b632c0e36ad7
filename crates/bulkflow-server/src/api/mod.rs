//! Router assembly and service-level endpoints

use std::path::PathBuf;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::error::AppError;
use crate::features;
use crate::middleware;
use crate::pipeline::PipelineHandle;

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub db: PgPool,
    pub pipeline: PipelineHandle,
    pub upload_dir: PathBuf,
}

/// Create the application router with all routes and middleware
pub fn create_router(state: AppState, config: &Config) -> Router {
    let feature_routes = features::router(features::UploadState {
        upload_dir: state.upload_dir.clone(),
        pipeline: state.pipeline.clone(),
    });

    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .merge(feature_routes)
        .layer(DefaultBodyLimit::max(config.upload.max_bytes))
        .layer(middleware::tracing_layer())
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Result<Response, AppError> {
    if let Err(e) = db::health_check(&state.db).await {
        tracing::error!("Database health check failed: {:?}", e);
        return Err(AppError::Unavailable("Database unavailable".to_string()));
    }

    let queues = state.pipeline.queue_counts().await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "database": "connected",
            "queues": queues,
        })),
    )
        .into_response())
}
