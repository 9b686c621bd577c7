use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;
use tracing::warn;

use courier_gateway::Gateway;
use courier_gateway::session;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// `GET /ws?token=<jwt>`. A rejected token still upgrades, then closes
/// with 4001 before the connection is registered.
pub async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match gateway.verifier.verify(&gateway.db, query.token.as_deref()).await {
        Ok(user) => ws.on_upgrade(move |socket| session::handle_connection(socket, gateway, user)),
        Err(e) => {
            warn!("WebSocket auth rejected: {}", e);
            ws.on_upgrade(session::reject_unauthorized)
        }
    }
}
