//! Observability endpoints: liveness/readiness probes, the Prometheus
//! text exposition format, and a human-readable JSON stats snapshot.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::http::HttpState;

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/stats", get(stats))
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready once the runtime device map has been populated at least once
/// by the Device Monitor, i.e. there has been time to reconcile against
/// the metadata store. An empty map on a fresh process with zero
/// qualifying devices is indistinguishable from "not yet reconciled",
/// so this is a best-effort signal, not a strict guarantee.
async fn readyz(State(state): State<HttpState>) -> impl IntoResponse {
    if state.engine.store.fetch_active_devices(1).await.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn stats(State(state): State<HttpState>) -> impl IntoResponse {
    let active_devices = state.engine.devices.len().await as u64;
    let active_connections = state.engine.pool.len().await;
    Json(state.engine.stats.snapshot(active_devices, active_connections))
}
