//! Database row types. Distinct from courier-types API models to keep the
//! DB layer independent; `into_out` converts at the boundary.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use courier_types::models::{ChatType, MessageOut, MessageStatus, UserOut};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub phone: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn into_out(self) -> UserOut {
        UserOut {
            id: self.id,
            phone: self.phone,
            username: self.username,
            display_name: self.display_name,
            bio: self.bio,
            avatar_url: self.avatar_url,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: Uuid,
    pub chat_type: ChatType,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub forwarded_from_id: Option<Uuid>,
    pub is_edited: bool,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Joined sender record; `None` when the sender was removed.
    pub sender: Option<UserRow>,
}

impl MessageRow {
    pub fn into_out(self) -> MessageOut {
        MessageOut {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            sender: self.sender.map(UserRow::into_out),
            content: self.content,
            image_url: self.image_url,
            forwarded_from_id: self.forwarded_from_id,
            is_edited: self.is_edited,
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Timestamp format written by this crate. Fixed width, so text ordering
/// matches time ordering.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. SQLite defaults are "YYYY-MM-DD HH:MM:SS"
/// without timezone; those are read as naive UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn col_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn col_opt_uuid(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn col_time(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn col_opt_time(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_timestamp(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn col_status(row: &Row, idx: usize) -> rusqlite::Result<MessageStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

pub(crate) fn col_chat_type(row: &Row, idx: usize) -> rusqlite::Result<ChatType> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}
