use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageOut, MessageStatus};

/// Events sent FROM client TO server over the real-time channel.
///
/// Unknown `type` values and missing fields fail to decode; the session
/// loop logs and skips such frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Post a text message into a chat. Older clients send `"type": "message"`.
    #[serde(alias = "message")]
    SendMessage {
        chat_id: Uuid,
        #[serde(default)]
        content: String,
    },

    /// The user is composing in a chat
    Typing { chat_id: Uuid },

    /// The user has read a message
    Read { chat_id: Uuid, message_id: Uuid },
}

/// Events pushed FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was created in a chat the recipient belongs to
    NewMessage { message: MessageOut },

    /// A message's delivery status changed
    StatusUpdate {
        message_id: Uuid,
        chat_id: Uuid,
        status: MessageStatus,
    },

    /// Someone is composing
    Typing { chat_id: Uuid, user_id: Uuid },

    /// A contact came online or went offline
    Presence { user_id: Uuid, online: bool },

    /// The recipient was added to a chat
    ChatAdded { chat_id: Uuid },

    /// A message's content changed
    MessageEdited { message: MessageOut },

    /// A message was removed
    MessageDeleted { message_id: Uuid, chat_id: Uuid },

    /// A contact changed their avatar
    AvatarUpdated {
        user_id: Uuid,
        avatar_url: Option<String>,
    },
}

impl ServerEvent {
    /// Wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::StatusUpdate { .. } => "status_update",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::ChatAdded { .. } => "chat_added",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::AvatarUpdated { .. } => "avatar_updated",
        }
    }
}
