pub mod auth;
pub mod chats;
pub mod messages;
pub mod middleware;
pub mod users;


use axum::{
    Router,
    http::StatusCode,
    routing::{get, patch, post, put},
};
use tracing::error;
use uuid::Uuid;

use courier_db::Database;
use courier_gateway::store::run_blocking;

pub use auth::{AppState, AppStateInner};

/// REST surface. Everything except register/login requires a bearer token.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login));

    let protected = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/users/search", get(users::search_users))
        .route("/api/users/me", patch(users::update_profile))
        .route("/api/users/me/avatar", put(users::set_avatar))
        .route("/api/users/{user_id}", get(users::get_user))
        .route("/api/chats", post(chats::create_chat).get(chats::list_chats))
        .route("/api/chats/forward", post(messages::forward_message))
        .route("/api/chats/private/{user_id}", get(chats::private_chat))
        .route("/api/chats/{chat_id}", get(chats::get_chat))
        .route("/api/chats/{chat_id}/members", post(chats::add_member))
        .route(
            "/api/chats/{chat_id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route(
            "/api/chats/{chat_id}/messages/{message_id}",
            put(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/api/chats/{chat_id}/messages/{message_id}/status",
            patch(messages::update_status),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    public.merge(protected).with_state(state)
}

/// Run a storage call off the async runtime; any failure is a 500.
pub(crate) async fn blocking<F, T>(state: &AppStateInner, f: F) -> Result<T, StatusCode>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    run_blocking(&state.gateway.db, f).await.map_err(|e| {
        error!("Storage failure: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub(crate) async fn require_member(
    state: &AppStateInner,
    chat_id: Uuid,
    user_id: Uuid,
) -> Result<(), StatusCode> {
    if blocking(state, move |db| db.is_member(chat_id, user_id)).await? {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}
