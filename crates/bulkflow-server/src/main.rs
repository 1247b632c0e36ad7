//! Bulkflow Server - Main entry point

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use bulkflow_common::logging::{init_logging, LogConfig};
use tokio::signal;
use tracing::info;

use bulkflow_server::{
    api::{self, AppState},
    config::Config,
    db,
    pipeline::{build_broker, PgRecordSink, PipelineCoordinator},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // LOG_* environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("bulkflow-server".to_string())
        .filter_directives("bulkflow_server=info,tower_http=info,sqlx=warn".to_string())
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting Bulkflow Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    tokio::fs::create_dir_all(&config.upload.dir).await?;
    info!(upload_dir = %config.upload.dir.display(), "Upload directory ready");

    let broker = build_broker(&config.pipeline, &db_pool);
    let sink = Arc::new(PgRecordSink::new(db_pool.clone()));
    let pipeline = PipelineCoordinator::start(broker, sink, &config.pipeline);

    let state = AppState {
        db: db_pool.clone(),
        pipeline: pipeline.handle(),
        upload_dir: config.upload.dir.clone(),
    };
    let app = api::create_router(state, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    info!("Waiting up to {} seconds for pipeline workers", timeout.as_secs());
    if tokio::time::timeout(timeout, pipeline.shutdown()).await.is_err() {
        tracing::warn!("Pipeline workers did not stop in time, in-flight jobs will be redelivered");
    }
    db_pool.close().await;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
