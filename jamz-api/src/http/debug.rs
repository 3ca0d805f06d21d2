//! Debug endpoints for audio signaling
//!
//! The toggle is only honoured in development or when explicitly allowed in
//! configuration; elsewhere it answers 403.

use axum::{extract::State, routing::get, routing::post, Json, Router};
use jamz_core::service::RejectionCounts;
use jamz_sfu::{PoolStats, WorkerStats};
use serde::{Deserialize, Serialize};

use crate::http::{AppResult, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingStatus {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugMetrics {
    #[serde(flatten)]
    pub rejections: RejectionCounts,
    pub connections: usize,
    pub sessions: usize,
    pub workers: usize,
    pub workers_alive: usize,
    pub routers: usize,
    pub transports: usize,
    /// Each live worker's own accounting
    pub worker_details: Vec<WorkerStats>,
}

pub fn create_debug_router() -> Router<AppState> {
    Router::new()
        .route("/debug/audio-signaling", get(signaling_status))
        .route("/debug/audio-signaling/toggle", post(toggle_signaling))
        .route("/debug/metrics", get(debug_metrics))
}

pub async fn signaling_status(State(state): State<AppState>) -> Json<SignalingStatus> {
    Json(SignalingStatus {
        enabled: state.gateway.context().is_enabled(),
    })
}

pub async fn toggle_signaling(State(state): State<AppState>) -> AppResult<Json<SignalingStatus>> {
    let enabled = state.gateway.context().toggle()?;
    Ok(Json(SignalingStatus { enabled }))
}

pub async fn debug_metrics(State(state): State<AppState>) -> Json<DebugMetrics> {
    let gateway = &state.gateway;
    let PoolStats {
        workers,
        workers_alive,
        routers,
        transports,
    } = gateway.pool().stats();

    Json(DebugMetrics {
        rejections: gateway.rejection_counts(),
        connections: gateway.hub().connection_count(),
        sessions: gateway.hub().session_count(),
        workers,
        workers_alive,
        routers,
        transports,
        worker_details: gateway.pool().worker_stats().await,
    })
}
