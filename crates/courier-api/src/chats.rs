use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use courier_db::Database;
use courier_db::models::ChatRow;
use courier_types::api::{AddMemberQuery, ChatCreate};
use courier_types::events::ServerEvent;
use courier_types::models::{ChatOut, ChatType, UserOut};

use crate::{AppState, blocking};

/// Chat with its member list and newest message.
fn chat_out(db: &Database, chat: ChatRow) -> anyhow::Result<ChatOut> {
    let members = db.members(chat.id)?.into_iter().map(|row| row.into_out()).collect();
    let last_message = db.last_message(chat.id)?.map(|row| row.into_out());
    Ok(ChatOut {
        id: chat.id,
        chat_type: chat.chat_type,
        title: chat.title,
        avatar_url: chat.avatar_url,
        created_at: chat.created_at,
        members,
        last_message,
    })
}

fn load_chat_out(db: &Database, chat_id: Uuid) -> anyhow::Result<ChatOut> {
    let chat = db
        .get_chat(chat_id)?
        .ok_or_else(|| anyhow::anyhow!("Chat {} vanished", chat_id))?;
    chat_out(db, chat)
}

pub async fn create_chat(
    State(state): State<AppState>,
    Extension(me): Extension<UserOut>,
    Json(req): Json<ChatCreate>,
) -> Result<impl IntoResponse, StatusCode> {
    let chat_id = Uuid::new_v4();
    let title = req.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());

    let (added, chat) = blocking(&state, move |db| {
        let added = db.create_chat(chat_id, req.chat_type, title.as_deref(), me.id, &req.member_ids)?;
        Ok((added, load_chat_out(db, chat_id)?))
    })
    .await?;

    let event = ServerEvent::ChatAdded { chat_id };
    for member_id in added {
        state.gateway.dispatcher.send_to_user(member_id, &event).await;
    }

    info!("{} created {} chat {}", me.id, chat.chat_type.as_str(), chat_id);
    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(me): Extension<UserOut>,
) -> Result<Json<Vec<ChatOut>>, StatusCode> {
    let chats = blocking(&state, move |db| {
        db.chats_for_user(me.id)?
            .into_iter()
            .map(|chat| chat_out(db, chat))
            .collect::<anyhow::Result<Vec<_>>>()
    })
    .await?;
    Ok(Json(chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(me): Extension<UserOut>,
) -> Result<Json<ChatOut>, StatusCode> {
    let chat = blocking(&state, move |db| {
        let Some(chat) = db.get_chat(chat_id)? else {
            return Ok(Err(StatusCode::NOT_FOUND));
        };
        if !db.is_member(chat_id, me.id)? {
            return Ok(Err(StatusCode::FORBIDDEN));
        }
        Ok(Ok(chat_out(db, chat)?))
    })
    .await??;
    Ok(Json(chat))
}

/// Existing two-person private chat with `user_id`, or a new one.
pub async fn private_chat(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(me): Extension<UserOut>,
) -> Result<Json<ChatOut>, StatusCode> {
    if user_id == me.id {
        return Err(StatusCode::BAD_REQUEST);
    }

    let chat = blocking(&state, move |db| {
        if let Some(chat_id) = db.find_private_chat(me.id, user_id)? {
            return Ok(Ok(load_chat_out(db, chat_id)?));
        }
        if db.get_user_by_id(user_id)?.is_none() {
            return Ok(Err(StatusCode::NOT_FOUND));
        }
        let chat_id = Uuid::new_v4();
        db.create_chat(chat_id, ChatType::Private, None, me.id, &[user_id])?;
        Ok(Ok(load_chat_out(db, chat_id)?))
    })
    .await??;
    Ok(Json(chat))
}

/// Add a user to a group chat; the new member is told via `chat_added`.
pub async fn add_member(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<AddMemberQuery>,
    Extension(me): Extension<UserOut>,
) -> Result<impl IntoResponse, StatusCode> {
    let member_id = query.member_id;

    blocking(&state, move |db| {
        let Some(chat) = db.get_chat(chat_id)? else {
            return Ok(Err(StatusCode::NOT_FOUND));
        };
        if chat.chat_type != ChatType::Group {
            return Ok(Err(StatusCode::BAD_REQUEST));
        }
        if !db.is_member(chat_id, me.id)? {
            return Ok(Err(StatusCode::FORBIDDEN));
        }
        if db.get_user_by_id(member_id)?.is_none() {
            return Ok(Err(StatusCode::NOT_FOUND));
        }
        if !db.add_member(chat_id, member_id)? {
            return Ok(Err(StatusCode::CONFLICT));
        }
        Ok(Ok(()))
    })
    .await??;

    state
        .gateway
        .dispatcher
        .send_to_user(member_id, &ServerEvent::ChatAdded { chat_id })
        .await;

    Ok(Json(json!({ "detail": "Member added" })))
}
