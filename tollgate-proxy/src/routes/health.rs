//! Health check and metrics endpoints.

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::{encode_metrics, observe_queue, set_backend_healthy};
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = state.queue.status();

    match state.forwarder.health_check().await {
        Ok(_) => {
            set_backend_healthy(true);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "healthy",
                    "upstream": "connected",
                    "upstream_url": state.config.ollama_url,
                    "queue": queue,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            set_backend_healthy(false);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "upstream": "disconnected",
                    "upstream_url": state.config.ollama_url,
                    "error": e.to_string(),
                    "queue": queue,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
    }
}

/// Gateway statistics
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.stats.lock().await.clone();
    let queue = state.queue.status();

    Json(json!({
        "proxy": {
            "requests_total": stats.requests_total,
            "requests_success": stats.requests_success,
            "requests_failed": stats.requests_failed,
            "requests_queued": stats.requests_queued,
            "requests_rejected": stats.requests_rejected,
            "tokens_recorded": stats.tokens_recorded,
            "success_rate": stats.success_rate()
        },
        "queue": queue
    }))
}

/// Prometheus scrape endpoint
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    observe_queue(&state.queue.status());
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}

/// Ready check (for Kubernetes)
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.forwarder.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
