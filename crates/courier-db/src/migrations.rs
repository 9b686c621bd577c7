use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            phone         TEXT NOT NULL UNIQUE,
            username      TEXT UNIQUE,
            display_name  TEXT,
            bio           TEXT,
            avatar_url    TEXT,
            password      TEXT NOT NULL,
            last_seen     TEXT,
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            chat_type   TEXT NOT NULL DEFAULT 'private' CHECK (chat_type IN ('private', 'group')),
            title       TEXT,
            avatar_url  TEXT,
            created_by  TEXT REFERENCES users(id) ON DELETE SET NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_chat_members_user
            ON chat_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            chat_id             TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            sender_id           TEXT REFERENCES users(id) ON DELETE SET NULL,
            content             TEXT,
            image_url           TEXT,
            forwarded_from_id   TEXT REFERENCES users(id) ON DELETE SET NULL,
            is_edited           INTEGER NOT NULL DEFAULT 0,
            status              TEXT NOT NULL DEFAULT 'sent' CHECK (status IN ('sent', 'delivered', 'read')),
            created_at          TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);

        CREATE TABLE IF NOT EXISTS read_receipts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            read_at     TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_read_receipts_message
            ON read_receipts(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
