//! The HTTP surface mounted by `main.rs`: control-plane start/stop
//! callbacks and observability endpoints — a thin `State<T>` extractor
//! over the shared process state, one router builder merging every
//! route group.

pub mod control;
pub mod observability;

use axum::Router;

use crate::Engine;

/// Shared state every HTTP handler in this module extracts. `Engine`
/// is already cheap to clone (every field is an `Arc`); the Prometheus
/// handle is added alongside it rather than folded into `Engine`
/// itself, since it's a presentation concern of this HTTP surface, not
/// of the transmission engine.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Engine,
    pub prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .merge(control::router())
        .merge(observability::router())
        .with_state(state)
}
