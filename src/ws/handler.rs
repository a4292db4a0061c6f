//! WebSocket upgrade endpoint.
//!
//! The client supplies its user id at handshake time; authentication of that
//! id is the API collaborator's job and happens before the client ever
//! reaches us. A handshake without a resolvable user id is rejected before
//! the upgrade.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use crate::registry::UserId;
use crate::state::AppState;
use crate::ws::actor;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: UserId,
}

/// GET /ws?user_id=N
/// A missing or non-numeric `user_id` fails the `Query` extractor with 400;
/// a non-positive one is rejected here.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    if params.user_id <= 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    tracing::info!(user_id = params.user_id, "WebSocket handshake accepted");
    Ok(ws.on_upgrade(move |socket| actor::run_connection(socket, state, params.user_id)))
}
