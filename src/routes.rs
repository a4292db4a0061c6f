//! Router: the WebSocket endpoint and an operational health check.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// GET /health — liveness plus a few dispatch counters.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "pending_deliveries": state.dispatcher.pending_count(),
        "started_at": state.started_at,
        "timestamp": Utc::now(),
    }))
}

/// Build the axum Router. CORS stays open: the browser only reaches /health
/// cross-origin, and the WebSocket handshake is not subject to CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}
