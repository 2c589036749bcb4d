use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::ResponseError;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig as TransportConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};

use crate::auth::{AuthService, Identity};
use crate::config::WebSocketConfig;
use crate::db::{MembershipAuthority, MessageStore, RoomId};
use crate::error::{AppError, AuthError};
use crate::websocket::connection::run_session;
use crate::websocket::hub::{ClientInfo, Hub};
use crate::Result;

const ROOM_PATH_PREFIX: &str = "/ws/rooms/";

/// Accepts websocket connections, admits them, and hands them to the hub.
pub struct WebSocketServer {
    hub: Hub,
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipAuthority>,
    auth: Arc<AuthService>,
    config: WebSocketConfig,
}

impl WebSocketServer {
    pub fn new(
        hub: Hub,
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn MembershipAuthority>,
        auth: Arc<AuthService>,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            hub,
            store,
            membership,
            auth,
            config,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("WebSocket server accepting connections at ws://{}{}{{room_id}}", addr, ROOM_PATH_PREFIX);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let mut admitted: Option<(RoomId, Identity)> = None;
        let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            match admit_request(&self.auth, request) {
                Ok(admission) => {
                    admitted = Some(admission);
                    Ok(response)
                }
                Err(e) => {
                    warn!(peer = %addr, error = %e, "Rejected websocket handshake");
                    Err(error_response(&e))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
            raw_stream,
            callback,
            Some(self.transport_config()),
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake: {}", e);
                return;
            }
        };

        let Some((room_id, identity)) = admitted else {
            return;
        };

        match self.membership.is_member(identity.user_id, room_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(user_id = identity.user_id, room_id, "Access denied: not a room member");
                self.refuse(ws_stream, &AppError::AuthError(AuthError::NotMember)).await;
                return;
            }
            Err(e) => {
                error!(user_id = identity.user_id, room_id, error = %e, "Membership check failed");
                self.refuse(ws_stream, &e).await;
                return;
            }
        }

        let info = ClientInfo::new(identity.user_id, identity.username, room_id);
        info!(
            peer = %addr,
            client_id = %info.client_id,
            user_id = info.user_id,
            room_id,
            "Connection admitted"
        );

        run_session(
            ws_stream,
            info,
            self.hub.clone(),
            self.store.clone(),
            &self.config,
        )
        .await;
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..TransportConfig::default()
        }
    }

    async fn refuse(&self, mut ws: WebSocketStream<TcpStream>, reason: &AppError) {
        let code = match reason {
            AppError::AuthError(_) => CloseCode::Policy,
            _ => CloseCode::Error,
        };
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = timeout(self.config.write_wait(), ws.close(Some(frame))).await;
    }
}

/// Works out which room the handshake targets and who is asking.
pub fn admit_request(auth: &AuthService, request: &Request) -> Result<(RoomId, Identity)> {
    let room_id = parse_room_id(request.uri().path())?;

    let token = bearer_token(request)
        .or_else(|| query_token(request.uri().query()))
        .ok_or(AuthError::MissingToken)?;

    let identity = auth.validate_token(&token)?;
    Ok((room_id, identity))
}

pub fn parse_room_id(path: &str) -> Result<RoomId> {
    path.strip_prefix(ROOM_PATH_PREFIX)
        .map(|rest| rest.trim_end_matches('/'))
        .and_then(|id| id.parse::<RoomId>().ok())
        .ok_or_else(|| AppError::ValidationError(format!("Invalid room path: {}", path)))
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

fn query_token(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

fn error_response(err: &AppError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::from_u16(err.status_code().as_u16())
        .unwrap_or(StatusCode::BAD_REQUEST);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, bearer: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_parse_room_id() {
        assert_eq!(parse_room_id("/ws/rooms/3").unwrap(), 3);
        assert_eq!(parse_room_id("/ws/rooms/42/").unwrap(), 42);
        assert!(matches!(parse_room_id("/ws/rooms/abc"), Err(AppError::ValidationError(_))));
        assert!(parse_room_id("/ws/rooms/").is_err());
        assert!(parse_room_id("/ws").is_err());
        assert!(parse_room_id("/other/3").is_err());
    }

    #[test]
    fn test_admit_with_bearer_header() {
        let auth = AuthService::new("test_secret".to_string());
        let token = auth.issue_token(7, "alice").unwrap();

        let (room_id, identity) = admit_request(&auth, &request("/ws/rooms/3", Some(&token))).unwrap();
        assert_eq!(room_id, 3);
        assert_eq!(identity.user_id, 7);
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn test_admit_with_query_token() {
        let auth = AuthService::new("test_secret".to_string());
        let token = auth.issue_token(8, "bob").unwrap();

        let uri = format!("/ws/rooms/5?token={}", token);
        let (room_id, identity) = admit_request(&auth, &request(&uri, None)).unwrap();
        assert_eq!(room_id, 5);
        assert_eq!(identity.user_id, 8);
    }

    #[test]
    fn test_admit_rejects_missing_or_bad_token() {
        let auth = AuthService::new("test_secret".to_string());

        let missing = admit_request(&auth, &request("/ws/rooms/3", None));
        assert!(matches!(missing, Err(AppError::AuthError(AuthError::MissingToken))));

        let bad = admit_request(&auth, &request("/ws/rooms/3", Some("garbage")));
        assert!(matches!(bad, Err(AppError::AuthError(AuthError::InvalidToken))));
    }

    #[tokio::test]
    async fn test_membership_failure_closes_with_error() {
        use crate::db::{MockMembershipAuthority, MockMessageStore};
        use crate::error::DatabaseError;
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        let mut membership = MockMembershipAuthority::new();
        membership
            .expect_is_member()
            .withf(|user_id, room_id| *user_id == 7 && *room_id == 3)
            .times(1)
            .returning(|_, _| Err(AppError::DatabaseError(DatabaseError::ConnectionError("down".into()))));

        let auth = Arc::new(AuthService::new("test_secret".to_string()));
        let hub = Hub::spawn();
        let server = Arc::new(WebSocketServer::new(
            hub.clone(),
            Arc::new(MockMessageStore::new()),
            Arc::new(membership),
            auth.clone(),
            WebSocketConfig::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));

        let token = auth.issue_token(7, "alice").unwrap();
        let url = format!("ws://{}/ws/rooms/3?token={}", addr, token);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Error),
            other => panic!("expected close frame, got {:?}", other),
        }

        hub.flush().await;
        assert_eq!(hub.room_count().await, 0);
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&AppError::AuthError(AuthError::MissingToken));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = error_response(&AppError::ValidationError("bad path".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
