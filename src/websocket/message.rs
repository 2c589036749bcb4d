use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ChatMessage, RoomId, UserId};

pub type ClientId = Uuid;

/// Frames a client may send after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message {
        #[serde(default)]
        content: String,
    },
    #[serde(other)]
    Unknown,
}

/// Events pushed to every member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Message {
        room_id: RoomId,
        message: ChatMessage,
    },
    Join {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },
    Leave {
        room_id: RoomId,
        user_id: UserId,
        username: String,
    },
    Error {
        room_id: RoomId,
        error: String,
    },
}

impl ServerMessage {
    pub fn room_id(&self) -> RoomId {
        match self {
            ServerMessage::Message { room_id, .. }
            | ServerMessage::Join { room_id, .. }
            | ServerMessage::Leave { room_id, .. }
            | ServerMessage::Error { room_id, .. } => *room_id,
        }
    }
}

/// A fan-out request: one event for one room, optionally skipping a sender
/// or narrowed to a single member.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub room_id: RoomId,
    pub event: ServerMessage,
    pub exclude: Option<ClientId>,
    pub target: Option<ClientId>,
}

impl Envelope {
    pub fn new(event: ServerMessage) -> Self {
        Self {
            room_id: event.room_id(),
            event,
            exclude: None,
            target: None,
        }
    }

    pub fn excluding(mut self, client_id: ClientId) -> Self {
        self.exclude = Some(client_id);
        self
    }

    pub fn only(mut self, client_id: ClientId) -> Self {
        self.target = Some(client_id);
        self
    }

    pub(crate) fn reaches(&self, client_id: &ClientId) -> bool {
        self.exclude != Some(*client_id) && self.target.map_or(true, |t| t == *client_id)
    }
}
