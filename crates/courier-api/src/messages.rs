use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use courier_db::NewMessage;
use courier_types::api::{ForwardMessageRequest, MessageEdit, MessageStatusUpdate, SendMessageRequest};
use courier_types::events::ServerEvent;
use courier_types::models::{MessageOut, MessageStatus, UserOut};

use crate::{AppState, AppStateInner, blocking, require_member};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Persist a message, fan it out to the chat and run the delivered check:
/// the same path a real-time `send_message` takes.
async fn publish(state: &AppStateInner, new: NewMessage) -> Result<MessageOut, StatusCode> {
    let chat_id = new.chat_id;
    let (message, member_ids) = blocking(state, move |db| {
        let row = db.insert_message(&new)?;
        Ok((row.into_out(), db.member_ids(chat_id)?))
    })
    .await?;

    state
        .gateway
        .lifecycle
        .publish_new(message, &member_ids)
        .await
        .map_err(|e| {
            error!("Status check for new message in {} failed: {:#}", chat_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn broadcast_to_chat(state: &AppStateInner, chat_id: Uuid, event: ServerEvent) -> Result<(), StatusCode> {
    let member_ids = blocking(state, move |db| db.member_ids(chat_id)).await?;
    state
        .gateway
        .dispatcher
        .broadcast_to_members(&member_ids, &event, None)
        .await;
    Ok(())
}

/// Fetch a message in a chat and check the caller wrote it.
async fn own_message(
    state: &AppStateInner,
    chat_id: Uuid,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<MessageOut, StatusCode> {
    let message = blocking(state, move |db| db.get_message_in_chat(message_id, chat_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    if message.sender_id != Some(user_id) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(message.into_out())
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(me): Extension<UserOut>,
) -> Result<Json<Vec<MessageOut>>, StatusCode> {
    require_member(&state, chat_id, me.id).await?;

    let limit = query.limit.min(200);
    let offset = query.offset;
    let rows = blocking(&state, move |db| db.list_messages(chat_id, limit, offset)).await?;
    Ok(Json(rows.into_iter().map(|row| row.into_out()).collect()))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let content = non_blank(req.content);
    let image_url = non_blank(req.image_url);
    if content.is_none() && image_url.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    require_member(&state, chat_id, me.id).await?;

    let message = publish(
        &state,
        NewMessage {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: Some(me.id),
            content,
            image_url,
            forwarded_from_id: None,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// Manual status change. Only `delivered` and `read` are accepted; status
/// never moves backwards.
pub async fn update_status(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<MessageStatusUpdate>,
) -> Result<Json<MessageOut>, StatusCode> {
    if req.status == MessageStatus::Sent {
        return Err(StatusCode::BAD_REQUEST);
    }
    require_member(&state, chat_id, me.id).await?;

    state
        .gateway
        .lifecycle
        .set_status(me.id, chat_id, message_id, req.status)
        .await
        .map_err(|e| {
            error!("Status update for {} failed: {:#}", message_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<MessageEdit>,
) -> Result<Json<MessageOut>, StatusCode> {
    let content = non_blank(Some(req.content)).ok_or(StatusCode::BAD_REQUEST)?;
    own_message(&state, chat_id, message_id, me.id).await?;

    let message = blocking(&state, move |db| db.edit_message(message_id, &content))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?
        .into_out();

    broadcast_to_chat(
        &state,
        chat_id,
        ServerEvent::MessageEdited {
            message: message.clone(),
        },
    )
    .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<UserOut>,
) -> Result<StatusCode, StatusCode> {
    own_message(&state, chat_id, message_id, me.id).await?;

    if !blocking(&state, move |db| db.delete_message(message_id)).await? {
        return Err(StatusCode::NOT_FOUND);
    }

    broadcast_to_chat(&state, chat_id, ServerEvent::MessageDeleted { message_id, chat_id }).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Copy a message into another chat. The copy records who originally wrote
/// it and goes through the normal new-message path.
pub async fn forward_message(
    State(state): State<AppState>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<ForwardMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let source_id = req.message_id;
    let original = blocking(&state, move |db| db.get_message(source_id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    require_member(&state, original.chat_id, me.id).await?;
    require_member(&state, req.to_chat_id, me.id).await?;

    let message = publish(
        &state,
        NewMessage {
            id: Uuid::new_v4(),
            chat_id: req.to_chat_id,
            sender_id: Some(me.id),
            content: original.content,
            image_url: original.image_url,
            forwarded_from_id: original.sender_id,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
