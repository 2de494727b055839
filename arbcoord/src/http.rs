//! Operational HTTP surface: liveness, status snapshot and Prometheus
//! metrics. The dashboard proper lives outside this service.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use arbcoord_cluster::{Coordinator, LifecycleState};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(coordinator)
}

async fn healthz(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.state() {
        LifecycleState::Running => (StatusCode::OK, "ok").into_response(),
        state => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "state": state.as_str() })),
        )
            .into_response(),
    }
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let snapshot = coordinator.status();
    if snapshot.state == LifecycleState::Error {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(snapshot)).into_response()
    } else {
        Json(snapshot).into_response()
    }
}

async fn metrics() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        arbcoord_core::metrics::encode_text(),
    )
        .into_response()
}
