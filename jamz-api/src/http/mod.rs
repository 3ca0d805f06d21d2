// Module: http
// HTTP surface: health probes, metrics, debug switches and the signaling socket

pub mod debug;
pub mod error;
pub mod health;
pub mod websocket;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::SignalingGateway;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SignalingGateway>,
    /// Largest inbound WebSocket message accepted, in bytes
    pub max_message_size: usize,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: Arc<SignalingGateway>, max_message_size: usize) -> Self {
        Self {
            gateway,
            max_message_size,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::create_health_router())
        .merge(debug::create_debug_router())
        .merge(websocket::create_websocket_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
