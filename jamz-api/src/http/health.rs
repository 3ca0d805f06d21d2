//! Health check and Prometheus endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use jamz_core::metrics;

use crate::http::{AppError, AppState};

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Prometheus text exposition. Pool gauges are refreshed on scrape.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    metrics::media::record_pool_stats(&state.gateway.pool().stats());
    let body = metrics::gather_metrics()
        .map_err(|e| AppError::internal_server_error(format!("Failed to encode metrics: {e}")))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
