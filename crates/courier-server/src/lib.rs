pub mod config;
pub mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use courier_api::AppStateInner;
use courier_gateway::Gateway;

/// Full HTTP surface: REST under `/api`, the real-time channel at `/ws`.
pub fn build_app(gateway: Gateway, jwt_secret: String, token_ttl: chrono::Duration) -> Router {
    let api_state = Arc::new(AppStateInner {
        gateway: gateway.clone(),
        jwt_secret,
        token_ttl,
    });

    let ws_route = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .with_state(gateway);

    Router::new()
        .merge(courier_api::router(api_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
