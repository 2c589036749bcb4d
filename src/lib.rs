pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{AuthService, Identity};
pub use db::{MembershipAuthority, MessageStore, PgStore};
pub use websocket::{Hub, WebSocketServer};

/// Health check endpoint handler
/// Returns server status, a timestamp, and how many rooms and clients are live
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "rooms": state.hub.room_count().await,
        "clients": state.hub.client_count().await,
    }))
}

/// Lists the clients currently connected to a room
pub async fn room_clients(state: web::Data<AppState>, path: web::Path<db::RoomId>) -> HttpResponse {
    let room_id = path.into_inner();
    let clients = state.hub.room_clients(room_id).await;

    HttpResponse::Ok().json(serde_json::json!({
        "room_id": room_id,
        "count": clients.len(),
        "clients": clients,
    }))
}

/// Diagnostics routes served next to the websocket listener
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/rooms/{room_id}/clients", web::get().to(room_clients));
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub hub: Hub,
}

impl AppState {
    pub fn new(config: Settings, hub: Hub) -> Self {
        Self {
            config: Arc::new(config),
            hub,
        }
    }
}
