//! Health and metrics HTTP surface (§6), served on `MANAGER_PORT` /
//! `METRICS_PORT`. Mirrors the original's aiohttp `/health` and `/metrics`
//! routes on a shared composition-root state instead of module globals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::metrics_handler;
use crate::pool::WorkerPool;
use crate::scaling::ScalingService;

/// Shared state the health/metrics routes read from; built once at startup
/// and cloned cheaply (everything inside is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub pools: Vec<Arc<WorkerPool>>,
    pub scaling: Arc<ScalingService>,
}

/// Builds the router exposing `/health` and `/metrics`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `addr` and serves `router(state)` until the process is killed.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(state)).await
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let mut worker_types = serde_json::Map::new();
    let mut any_unhealthy = false;

    for pool in &state.pools {
        let stats = pool.statistics().await;
        if stats.total > 0 && stats.healthy == 0 {
            any_unhealthy = true;
        }
        worker_types.insert(
            pool.worker_type().to_string(),
            json!({
                "healthy": stats.healthy,
                "total": stats.total,
                "jobs_completed": stats.jobs_completed,
                "jobs_failed": stats.jobs_failed,
                "success_rate": stats.success_rate(),
            }),
        );
    }

    Json(json!({
        "status": if any_unhealthy { "degraded" } else { "healthy" },
        "worker_types": worker_types,
        "timestamp": now_secs(),
    }))
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
