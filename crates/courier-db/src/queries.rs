use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use courier_types::models::{ChatType, MessageStatus};

use crate::Database;
use crate::models::{
    ChatRow, MessageRow, UserRow, col_chat_type, col_opt_time, col_opt_uuid, col_status, col_time,
    col_uuid, now_text,
};

const USER_COLUMNS: &str =
    "id, phone, username, display_name, bio, avatar_url, last_seen, created_at";

const CHAT_COLUMNS: &str = "id, chat_type, title, avatar_url, created_by, created_at";

// Sender is LEFT JOINed so messages from removed users still load.
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.chat_id, m.sender_id, m.content, m.image_url, m.forwarded_from_id,
           m.is_edited, m.status, m.created_at,
           u.id, u.phone, u.username, u.display_name, u.bio, u.avatar_url, u.last_seen, u.created_at
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id";

/// A message about to be persisted. Status always starts at `sent`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub forwarded_from_id: Option<Uuid>,
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        phone: &str,
        display_name: Option<&str>,
        password_hash: &str,
    ) -> Result<UserRow> {
        self.with_conn(|conn| {
            let now = now_text();
            conn.execute(
                "INSERT INTO users (id, phone, display_name, password, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.to_string(), phone, display_name, password_hash, now],
            )?;
            query_user(conn, id)?.ok_or_else(|| anyhow::anyhow!("User vanished after insert: {}", id))
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn get_user_by_phone(&self, phone: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE phone = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [phone], |row| user_from_row(row, 0)).optional()?)
        })
    }

    /// Returns (user_id, password_hash) for a login attempt.
    pub fn get_credentials(&self, phone: &str) -> Result<Option<(Uuid, String)>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT id, password FROM users WHERE phone = ?1", [phone], |row| {
                    Ok((col_uuid(row, 0)?, row.get(1)?))
                })
                .optional()?)
        })
    }

    pub fn username_taken(&self, username: &str, except: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let taken = conn
                .query_row(
                    "SELECT 1 FROM users WHERE username = ?1 AND id != ?2",
                    params![username, except.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            Ok(taken)
        })
    }

    /// `None` fields are left unchanged.
    pub fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        display_name: Option<&str>,
        bio: Option<&str>,
    ) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET
                    username = COALESCE(?2, username),
                    display_name = COALESCE(?3, display_name),
                    bio = COALESCE(?4, bio)
                 WHERE id = ?1",
                params![id.to_string(), username, display_name, bio],
            )?;
            query_user(conn, id)
        })
    }

    pub fn set_avatar(&self, id: Uuid, avatar_url: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET avatar_url = ?2 WHERE id = ?1",
                params![id.to_string(), avatar_url],
            )?;
            query_user(conn, id)
        })
    }

    pub fn touch_last_seen(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE id = ?1",
                params![id.to_string(), now_text()],
            )?;
            Ok(())
        })
    }

    pub fn search_users(&self, query: &str, limit: u32) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users
                 WHERE phone LIKE ?1 OR username LIKE ?1 OR display_name LIKE ?1
                 ORDER BY created_at
                 LIMIT ?2",
                USER_COLUMNS
            );
            let pattern = format!("%{}%", query);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![pattern, limit], |row| user_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // -- Chats --

    /// Create a chat with `created_by` as its first member. Other listed
    /// users are added if they exist; returns the ids actually added
    /// (never including the creator).
    pub fn create_chat(
        &self,
        id: Uuid,
        chat_type: ChatType,
        title: Option<&str>,
        created_by: Uuid,
        member_ids: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = now_text();
            tx.execute(
                "INSERT INTO chats (id, chat_type, title, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), chat_type.as_str(), title, created_by.to_string(), now],
            )?;
            insert_member(&tx, id, created_by)?;

            let mut added = Vec::new();
            for &member_id in member_ids {
                if member_id == created_by || added.contains(&member_id) {
                    continue;
                }
                if query_user(&tx, member_id)?.is_some() {
                    insert_member(&tx, id, member_id)?;
                    added.push(member_id);
                }
            }

            tx.commit()?;
            Ok(added)
        })
    }

    pub fn get_chat(&self, id: Uuid) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS);
            Ok(conn.query_row(&sql, [id.to_string()], chat_from_row).optional()?)
        })
    }

    /// Chats the user belongs to, newest first.
    pub fn chats_for_user(&self, user_id: Uuid) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chats
                 WHERE id IN (SELECT chat_id FROM chat_members WHERE user_id = ?1)
                 ORDER BY created_at DESC",
                CHAT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], chat_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Returns false if the user was already a member.
    pub fn add_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| insert_member(conn, chat_id, user_id))
    }

    pub fn is_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id.to_string(), user_id.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            Ok(found)
        })
    }

    pub fn member_ids(&self, chat_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY joined_at, user_id",
            )?;
            let ids = stmt
                .query_map([chat_id.to_string()], |row| col_uuid(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn members(&self, chat_id: Uuid) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users
                 WHERE id IN (SELECT user_id FROM chat_members WHERE chat_id = ?1)
                 ORDER BY created_at",
                USER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([chat_id.to_string()], |row| user_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Everyone sharing at least one chat with `user_id`, deduplicated
    /// across chats, never including the user themself.
    pub fn contact_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT other.user_id
                 FROM chat_members mine
                 JOIN chat_members other ON other.chat_id = mine.chat_id
                 WHERE mine.user_id = ?1 AND other.user_id != ?1",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| col_uuid(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn find_private_chat(&self, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT c.id FROM chats c
                     JOIN chat_members ma ON ma.chat_id = c.id AND ma.user_id = ?1
                     JOIN chat_members mb ON mb.chat_id = c.id AND mb.user_id = ?2
                     WHERE c.chat_type = 'private'
                     ORDER BY c.created_at
                     LIMIT 1",
                    params![a.to_string(), b.to_string()],
                    |row| col_uuid(row, 0),
                )
                .optional()?)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let now = now_text();
            conn.execute(
                "INSERT INTO messages (id, chat_id, sender_id, content, image_url, forwarded_from_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'sent', ?7, ?7)",
                params![
                    msg.id.to_string(),
                    msg.chat_id.to_string(),
                    msg.sender_id.map(|id| id.to_string()),
                    msg.content,
                    msg.image_url,
                    msg.forwarded_from_id.map(|id| id.to_string()),
                    now,
                ],
            )?;
            query_message(conn, msg.id)?
                .ok_or_else(|| anyhow::anyhow!("Message vanished after insert: {}", msg.id))
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Message lookup scoped to a chat; a message id from another chat is `None`.
    pub fn get_message_in_chat(&self, id: Uuid, chat_id: Uuid) -> Result<Option<MessageRow>> {
        Ok(self.get_message(id)?.filter(|m| m.chat_id == chat_id))
    }

    pub fn last_message(&self, chat_id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.chat_id = ?1 ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1",
                MESSAGE_SELECT
            );
            Ok(conn.query_row(&sql, [chat_id.to_string()], message_from_row).optional()?)
        })
    }

    /// Page of messages, newest `offset..offset+limit` returned oldest-first.
    pub fn list_messages(&self, chat_id: Uuid, limit: u32, offset: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.chat_id = ?1 ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?2 OFFSET ?3",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![chat_id.to_string(), limit, offset], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn edit_message(&self, id: Uuid, content: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, now_text()],
            )?;
            query_message(conn, id)
        })
    }

    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    /// Move a message forward along sent -> delivered -> read. A target at or
    /// behind the stored status leaves the row untouched. Returns whether the
    /// row changed.
    pub fn advance_message_status(&self, id: Uuid, status: MessageStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?2, updated_at = ?3
                 WHERE id = ?1
                   AND (CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END) < ?4",
                params![id.to_string(), status.as_str(), now_text(), status as u8],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns true only when a new receipt row was created.
    pub fn ensure_read_receipt(&self, message_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![message_id.to_string(), user_id.to_string(), now_text()],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn read_receipt_count(&self, message_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM read_receipts WHERE message_id = ?1",
                [message_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

fn insert_member(conn: &Connection, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        params![chat_id.to_string(), user_id.to_string(), now_text()],
    )?;
    Ok(changed > 0)
}

fn query_user(conn: &Connection, id: Uuid) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn
        .query_row(&sql, [id.to_string()], |row| user_from_row(row, 0))
        .optional()?)
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<MessageRow>> {
    let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
    Ok(conn
        .query_row(&sql, [id.to_string()], message_from_row)
        .optional()?)
}

fn user_from_row(row: &Row, base: usize) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: col_uuid(row, base)?,
        phone: row.get(base + 1)?,
        username: row.get(base + 2)?,
        display_name: row.get(base + 3)?,
        bio: row.get(base + 4)?,
        avatar_url: row.get(base + 5)?,
        last_seen: col_opt_time(row, base + 6)?,
        created_at: col_time(row, base + 7)?,
    })
}

fn chat_from_row(row: &Row) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: col_uuid(row, 0)?,
        chat_type: col_chat_type(row, 1)?,
        title: row.get(2)?,
        avatar_url: row.get(3)?,
        created_by: col_opt_uuid(row, 4)?,
        created_at: col_time(row, 5)?,
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<MessageRow> {
    let sender_present: Option<String> = row.get(9)?;
    let sender = match sender_present {
        Some(_) => Some(user_from_row(row, 9)?),
        None => None,
    };

    Ok(MessageRow {
        id: col_uuid(row, 0)?,
        chat_id: col_uuid(row, 1)?,
        sender_id: col_opt_uuid(row, 2)?,
        content: row.get(3)?,
        image_url: row.get(4)?,
        forwarded_from_id: col_opt_uuid(row, 5)?,
        is_edited: row.get(6)?,
        status: col_status(row, 7)?,
        created_at: col_time(row, 8)?,
        sender,
    })
}
