//! Bulkflow Server Library
//!
//! HTTP service that imports large CSV uploads into PostgreSQL.
//!
//! # Overview
//!
//! - **Upload API**: `POST /upload` streams a multipart CSV to disk and queues it
//! - **Pipeline**: a splitter stage turns each file into fixed-size batches on a
//!   durable queue, an insertion stage writes batches concurrently
//! - **Queue**: named queues with retries and exponential backoff, backed by
//!   PostgreSQL or by memory
//! - **Configuration**: environment-based configuration management
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bulkflow_server::pipeline::{build_broker, PgRecordSink, PipelineCoordinator};
//! use bulkflow_server::{config::Config, db};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::run_migrations(&pool).await?;
//!
//!     let broker = build_broker(&config.pipeline, &pool);
//!     let sink = Arc::new(PgRecordSink::new(pool.clone()));
//!     let pipeline = PipelineCoordinator::start(broker, sink, &config.pipeline);
//!
//!     pipeline.enqueue_file("uploads/customers.csv", "customers.csv").await?;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod middleware;
pub mod pipeline;

// Re-export commonly used types
pub use error::AppError;
