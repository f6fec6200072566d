//! Application State and Router

use std::sync::Arc;

use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::room::RoomManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,
    /// Room registry and signaling router.
    pub manager: Arc<RoomManager>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub const fn new(config: Arc<Config>, manager: Arc<RoomManager>) -> Self {
        Self { config, manager }
    }
}

/// Build the HTTP router: signaling WebSocket, ICE configuration and
/// liveness.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", any(crate::signal::handler))
        .route("/api/rtc/ice-servers", get(crate::rtc::get_ice_servers))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness endpoint.
async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.manager.room_count().await,
    }))
}
