//! WebSocket module for the room hub
//!
//! Connection admission, the per-connection read/write pumps, and the hub
//! that keeps room membership and fans events out to members.

mod connection;
mod hub;
mod message;
mod server;

pub use connection::{read_pump, run_session, write_pump, Inbound};
pub use hub::{Client, ClientInfo, Hub, OutboundQueue};
pub use message::{ClientId, ClientMessage, Envelope, ServerMessage};
pub use server::{admit_request, parse_room_id, WebSocketServer};
