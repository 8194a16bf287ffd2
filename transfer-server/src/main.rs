//! Transfer Server - Main entry point
//!
//! HTTP backend for exporting, inspecting, restoring and retiring
//! snapshot archives.

mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::audit_log::SqliteAuditSink;
use crate::models::entities::SqliteStore;
use crate::services::retention::start_retention_service;
use crate::state::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use transfer_core::{utils, TransferService, UnlockSecret};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a transfer configuration file (overrides TRANSFER_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting transfer-server v{} on port {}",
        env!("CARGO_PKG_VERSION"),
        config.port
    );

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let secret = match &config.unlock_secret {
        Some(secret) => UnlockSecret::new(secret.as_bytes())?,
        None => {
            tracing::warn!(
                "RESTORE_UNLOCK_SECRET is not set; using a random secret, unlock tokens will not survive a restart"
            );
            UnlockSecret::generate()
        }
    };

    let transfer = TransferService::new(
        config.transfer.clone(),
        secret,
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(SqliteAuditSink::new(pool.clone())),
    )?;

    // Build application state
    let state = Arc::new(AppState::new(pool, config.clone(), transfer));

    // Scheduled retention
    let cancel = CancellationToken::new();
    if let Some(secs) = config.purge_interval_secs {
        tracing::info!("Scheduled purge every {}s", secs);
        start_retention_service(state.clone(), Duration::from_secs(secs), cancel.clone());
    }

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    // r2d2 closes pooled connections once the last state handle drops.
    drop(state);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
