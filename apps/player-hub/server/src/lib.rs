//! Real-time relay between TV players and browser remote controls.
//!
//! A player connects to `/ws/player/:device_id`, controllers to
//! `/ws/control/:device_id`. Frames from the player are fanned out verbatim to
//! every controller of the same device; frames from a controller go verbatim
//! to the player. Controllers are told whenever the player comes or goes.

pub mod config;
pub mod connection;
pub mod hub;
pub mod lifecycle;
pub mod telemetry;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use player_hub_core::CLOSE_GOING_AWAY;
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tracing::info;

use crate::{
    config::{ConnectionSettings, ServerConfig},
    hub::{DeviceSnapshot, PlayerHub},
};

#[derive(Clone)]
pub struct AppState {
    pub hub: PlayerHub,
    pub settings: ConnectionSettings,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(hub: PlayerHub, settings: ConnectionSettings) -> Self {
        Self {
            hub,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    players_online: usize,
    controllers_active: usize,
    devices: Vec<DeviceSnapshot>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/player/:device_id", get(lifecycle::player_ws_handler))
        .route("/ws/control/:device_id", get(lifecycle::control_ws_handler))
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let hub = PlayerHub::new();
    let mut state = AppState::new(hub.clone(), config.connection.clone());
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("player-hub listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal(hub: PlayerHub) {
    let _ = signal::ctrl_c().await;
    let closed = hub.close_all(CLOSE_GOING_AWAY, "server shutting down");
    info!(closed, "closing live connections");
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(collect_stats(&state.hub))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn collect_stats(hub: &PlayerHub) -> StatsResponse {
    let devices = hub.snapshot();
    StatsResponse {
        players_online: devices.iter().filter(|d| d.player_online).count(),
        controllers_active: devices.iter().map(|d| d.controllers).sum(),
        devices,
    }
}
