use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::warn;
use uuid::Uuid;

use courier_gateway::presence::notify_contacts;
use courier_types::api::{AvatarUpdate, UserSearchQuery, UserUpdate};
use courier_types::events::ServerEvent;
use courier_types::models::UserOut;

use crate::{AppState, blocking};

const SEARCH_LIMIT: u32 = 20;

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<UserSearchQuery>,
    Extension(_me): Extension<UserOut>,
) -> Result<Json<Vec<UserOut>>, StatusCode> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let rows = blocking(&state, move |db| db.search_users(&q, SEARCH_LIMIT)).await?;
    Ok(Json(rows.into_iter().map(|row| row.into_out()).collect()))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_me): Extension<UserOut>,
) -> Result<Json<UserOut>, StatusCode> {
    blocking(&state, move |db| db.get_user_by_id(user_id))
        .await?
        .map(|row| Json(row.into_out()))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<UserUpdate>,
) -> Result<Json<UserOut>, StatusCode> {
    let username = req.username.map(|name| name.trim().to_string());
    if username.as_deref().is_some_and(str::is_empty) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let updated = blocking(&state, move |db| {
        if let Some(name) = &username {
            if db.username_taken(name, me.id)? {
                return Ok(Err(StatusCode::CONFLICT));
            }
        }
        let row = db.update_profile(
            me.id,
            username.as_deref(),
            req.display_name.as_deref(),
            req.bio.as_deref(),
        )?;
        Ok(row.ok_or(StatusCode::NOT_FOUND))
    })
    .await??;

    Ok(Json(updated.into_out()))
}

/// Record a new avatar URL and tell every contact once.
pub async fn set_avatar(
    State(state): State<AppState>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<AvatarUpdate>,
) -> Result<Json<UserOut>, StatusCode> {
    let avatar_url = req.avatar_url.trim().to_string();
    if avatar_url.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let user = blocking(&state, move |db| db.set_avatar(me.id, &avatar_url))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?
        .into_out();

    let event = ServerEvent::AvatarUpdated {
        user_id: user.id,
        avatar_url: user.avatar_url.clone(),
    };
    let gateway = &state.gateway;
    if let Err(e) = notify_contacts(&gateway.db, &gateway.dispatcher, user.id, &event).await {
        warn!("avatar_updated fan-out for {} failed: {:#}", user.id, e);
    }

    Ok(Json(user))
}
