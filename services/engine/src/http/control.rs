//! Control-plane callback routes: `POST` start/stop for a single
//! device. The control-plane service calls these after it mutates the
//! `devices` row; the engine reconciles its own runtime state in
//! response rather than polling.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use engine_proto::{ControlAck, StopRequest};

use crate::control::{ControlError, ControlHandler};
use crate::http::HttpState;

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/api/v1/devices/:device_id/start", post(start_device))
        .route("/api/v1/devices/:device_id/stop", post(stop_device))
}

async fn start_device(State(state): State<HttpState>, Path(device_id): Path<String>) -> impl IntoResponse {
    let handler = ControlHandler::new(state.engine.clone());
    match handler.start(&device_id).await {
        Ok(()) => (StatusCode::OK, Json(ControlAck { accepted: true })).into_response(),
        Err(ControlError::DeviceNotFound) => (StatusCode::NOT_FOUND, "device not found").into_response(),
        Err(ControlError::Store(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn stop_device(
    State(state): State<HttpState>,
    Path(device_id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    let reset_row_index = body.map(|Json(b)| b.reset_row_index).unwrap_or(false);
    let handler = ControlHandler::new(state.engine.clone());
    match handler.stop(&device_id, reset_row_index).await {
        Ok(()) => (StatusCode::OK, Json(ControlAck { accepted: true })).into_response(),
        Err(ControlError::DeviceNotFound) => (StatusCode::NOT_FOUND, "device not found").into_response(),
        Err(ControlError::Store(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
