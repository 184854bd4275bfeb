//! Nexus Stock: a local-first inventory, invoicing and cash register service.
//!
//! Everything is written to a local SQLite store first. Each mutation also
//! appends to an outbox that a background task replays against an optional
//! remote store whenever it is reachable.

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod cash;
pub mod categories;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod entities;
pub mod error;
pub mod http;
pub mod invoices;
pub mod logging;
pub mod models;
pub mod pos;
pub mod products;
pub mod sync;
pub mod validation;

use config::Config;

/// Load configuration, open the store, start the sync loop and serve the
/// API until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&config.logging.log_dir, config.logging.retention_days)?;

    info!("Starting Nexus Stock v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(
        db::init(&config.storage.data_dir)
            .with_context(|| format!("cannot open store in {}", config.storage.data_dir.display()))?,
    );
    auth::ensure_admin(&db, &config.admin)?;
    sync::purge_synced(&db, config.sync.retention_days)?;

    let remote = config.sync.remote_target();
    match &remote {
        Some(target) => info!(remote = %target.base_url, "Remote store configured"),
        None => info!("No remote store configured; changes stay queued locally"),
    }
    let sync_state = Arc::new(sync::SyncState::new(remote, config.sync.batch_size));

    let cancel = CancellationToken::new();
    let sync_task = sync::start_sync_loop(
        Arc::clone(&db),
        Arc::clone(&sync_state),
        config.sync.interval(),
        cancel.clone(),
    );

    let auth_state = auth::AuthState::with_api_keys(config.server.api_keys.clone());
    let state = http::AppState::new(db, sync_state, Arc::new(auth_state));
    let router = http::create_router(state, config.server.body_limit);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = sync_task.await {
        warn!(error = %e, "Sync loop ended abnormally");
    }
    info!("Nexus Stock stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C; shutting down");
        return;
    }
    info!("Shutdown requested");
}
