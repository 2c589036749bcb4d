use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RoomId = i64;
pub type UserId = i64;
pub type MessageId = i64;

/// A chat message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(room_id: RoomId, user_id: UserId, username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room_id,
            user_id,
            username: username.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(self, id: MessageId) -> ChatMessage {
        ChatMessage {
            id,
            room_id: self.room_id,
            user_id: self.user_id,
            username: self.username,
            content: self.content,
            created_at: self.created_at,
        }
    }
}

/// A persisted chat message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
