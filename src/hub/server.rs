use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, FleetDb};
use super::gateway::RemoteAgentClient;
use super::github::GitHubClient;
use super::lifecycle::LifecycleOptions;
use super::ws;
use crate::config::FleetToml;

/// Resolved settings for one server run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn from_toml(config: &FleetToml) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.port(),
            db_path: config.db_path(),
            dev_mode: config.server.dev_mode,
        }
    }
}

/// API routes plus the live feed, with request tracing.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open (and migrate) the database file, creating its directory.
pub fn open_database(path: &std::path::Path) -> Result<FleetDb> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    FleetDb::new(path).context("Failed to initialize fleet database")
}

pub async fn start_server(server: ServerConfig, settings: &FleetToml) -> Result<()> {
    let db = open_database(&server.db_path)?;

    let api_key = settings.api_key();
    if api_key.is_none() {
        tracing::warn!("no provider API key configured; task dispatch will fail");
    }
    let gateway = RemoteAgentClient::new(
        settings.provider.base_url.clone(),
        api_key,
        settings.request_timeout(),
    )
    .context("Failed to build provider client")?;

    let webhook_secret = settings.webhook_secret();
    if webhook_secret.is_none() {
        tracing::warn!("no webhook secret configured; webhook signatures are not verified");
    }

    let state = Arc::new(AppState::new(
        DbHandle::new(db),
        Arc::new(gateway),
        GitHubClient::new(settings.github.api_url.clone()),
        webhook_secret,
        LifecycleOptions {
            deduplicate: settings.webhooks.deduplicate,
        },
    ));

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr: SocketAddr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %server.db_path.display(), "fleet hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
