//! Authentication module for the room hub
//!
//! Verifies the bearer token presented on the websocket handshake and turns
//! it into an [`Identity`].

mod service;

pub use service::{AuthService, Claims, Identity};
