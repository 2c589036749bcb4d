//! Database module for the room hub
//!
//! Message persistence and room membership lookups, behind traits so the
//! websocket layer can run against any backend.

pub mod models;
pub mod operations;

pub use models::{ChatMessage, MessageId, NewMessage, RoomId, UserId};
pub use operations::{MembershipAuthority, MessageStore, PgStore};

#[cfg(test)]
pub use operations::{MockMembershipAuthority, MockMessageStore};
