use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fabula_server::acl::{AclOracle, AclStore};
use fabula_server::config::SyncConfig;
use fabula_server::registry::RoomRegistry;
use fabula_server::ws::{self, SyncState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SyncConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::fs::create_dir_all(&config.persist_dir).with_context(|| {
        format!("failed to create persistence directory {}", config.persist_dir.display())
    })?;

    let store = AclStore::open(&config.auth_db_path)?;
    let oracle = Arc::new(AclOracle::new(store, config.superusers.clone()));
    let registry = Arc::new(RoomRegistry::new(config.persist_dir.clone()));
    let app = build_router(SyncState { registry, oracle });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind sync listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        persist_dir = %config.persist_dir.display(),
        superusers = config.superusers.len(),
        "starting fabula sync server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("sync server exited unexpectedly")
}

fn build_router(state: SyncState) -> Router {
    Router::new().route("/healthz", get(healthz)).merge(ws::router(state))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
