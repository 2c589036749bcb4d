use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use crate::config::WebSocketConfig;
use crate::db::{MessageStore, NewMessage};
use crate::error::WebSocketError;
use crate::websocket::hub::{Client, ClientInfo, Hub, OutboundQueue};
use crate::websocket::message::{ClientId, ClientMessage, Envelope, ServerMessage};

/// Unregisters on drop, so every way out of a session releases the client.
struct Registration {
    hub: Hub,
    info: ClientInfo,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.info);
    }
}

/// Drives an admitted connection until either direction gives up.
///
/// The client is registered with the hub, then one task reads frames and one
/// writes the outbound queue. They share nothing except the queue and the
/// socket. Whichever stops first takes the connection down with it.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    info: ClientInfo,
    hub: Hub,
    store: Arc<dyn MessageStore>,
    config: &WebSocketConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client_id = info.client_id;
    let (client, queue) = Client::new(info.clone(), config.send_buffer);
    let inbound = Inbound::new(&client, hub.clone(), store);

    hub.register(client);
    let _registration = Registration {
        hub: hub.clone(),
        info: info.clone(),
    };

    let (sink, stream) = ws.split();
    let mut writer = tokio::spawn(write_pump(
        sink,
        queue,
        config.write_wait(),
        config.ping_period(),
        config.send_buffer,
    ));
    let mut reader = tokio::spawn(read_pump(stream, inbound, config.pong_wait()));

    tokio::select! {
        result = &mut reader => {
            log_pump_exit(client_id, "inbound", result);
            // Closing the queue is what tells the writer to send a close frame and stop.
            hub.unregister(&info);
            log_pump_exit(client_id, "outbound", writer.await);
        }
        result = &mut writer => {
            log_pump_exit(client_id, "outbound", result);
            reader.abort();
        }
    }

    info!(%client_id, room_id = info.room_id, "Connection closed");
}

fn log_pump_exit(
    client_id: ClientId,
    pump: &str,
    result: Result<Result<(), WebSocketError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => debug!(%client_id, pump, "Pump finished"),
        Ok(Err(e)) => info!(%client_id, pump, error = %e, "Pump stopped"),
        Err(e) if e.is_cancelled() => debug!(%client_id, pump, "Pump cancelled"),
        Err(e) => error!(%client_id, pump, error = %e, "Pump panicked"),
    }
}

/// Per-connection state the read side needs to act on inbound frames.
pub struct Inbound {
    info: ClientInfo,
    hub: Hub,
    store: Arc<dyn MessageStore>,
}

impl Inbound {
    pub fn new(client: &Client, hub: Hub, store: Arc<dyn MessageStore>) -> Self {
        Self {
            info: client.info().clone(),
            hub,
            store,
        }
    }

    /// Returns `Ok(false)` when the peer asked to close.
    pub async fn handle_message(&self, msg: Message) -> Result<bool, WebSocketError> {
        let client_msg: ClientMessage = match msg {
            Message::Text(text) => serde_json::from_str(&text)
                .map_err(|e| WebSocketError::InvalidFormat(e.to_string()))?,
            Message::Binary(data) => serde_json::from_slice(&data)
                .map_err(|e| WebSocketError::InvalidFormat(e.to_string()))?,
            Message::Close(_) => {
                debug!(client_id = %self.info.client_id, "Client initiated close");
                return Ok(false);
            }
            // Pings are answered by the transport; any frame already reset the deadline.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(true),
        };

        match client_msg {
            ClientMessage::Message { content } => self.handle_chat(content).await,
            ClientMessage::Unknown => {
                debug!(client_id = %self.info.client_id, "Ignoring unsupported event type");
            }
        }
        Ok(true)
    }

    async fn handle_chat(&self, content: String) {
        let draft = NewMessage::new(
            self.info.room_id,
            self.info.user_id,
            self.info.username.clone(),
            content,
        );

        match self.store.persist(draft).await {
            Ok(message) => {
                debug!(
                    client_id = %self.info.client_id,
                    message_id = message.id,
                    room_id = self.info.room_id,
                    "Message persisted"
                );
                // No exclusion: the sender gets its own copy back.
                self.hub.broadcast(Envelope::new(ServerMessage::Message {
                    room_id: self.info.room_id,
                    message,
                }));
            }
            Err(e) => {
                error!(
                    client_id = %self.info.client_id,
                    room_id = self.info.room_id,
                    error = %e,
                    "Error saving message"
                );
                self.hub.send_to(
                    &self.info,
                    ServerMessage::Error {
                        room_id: self.info.room_id,
                        error: "Failed to save message".to_string(),
                    },
                );
            }
        }
    }
}

/// Reads frames until the peer closes, breaks protocol, or goes quiet for
/// longer than `pong_wait`. Every frame, pongs included, resets the deadline.
pub async fn read_pump<R>(
    mut stream: R,
    inbound: Inbound,
    pong_wait: Duration,
) -> Result<(), WebSocketError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = match timeout(pong_wait, stream.next()).await {
            Err(_) => return Err(WebSocketError::Timeout(pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        if !inbound.handle_message(frame).await? {
            return Ok(());
        }
    }
}

/// Writes queued events and keepalive pings until the queue is closed or a
/// write fails or misses its deadline.
pub async fn write_pump<W>(
    mut sink: W,
    mut queue: OutboundQueue,
    write_wait: Duration,
    ping_period: Duration,
    max_batch: usize,
) -> Result<(), WebSocketError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            payload = queue.recv() => {
                let Some(first) = payload else {
                    // The hub let go of this client.
                    let _ = send_with_deadline(&mut sink, Message::Close(None), write_wait).await;
                    break Ok(());
                };
                let frame = coalesce(first, &mut queue, max_batch);
                if let Err(e) = send_with_deadline(&mut sink, Message::Text(frame), write_wait).await {
                    break Err(e);
                }
            }
            _ = ping.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, Message::Ping(Vec::new()), write_wait).await {
                    break Err(e);
                }
            }
        }
    };

    let _ = timeout(write_wait, sink.close()).await;
    result
}

/// Joins whatever is already waiting behind `first` into one newline-separated frame.
fn coalesce(first: Arc<str>, queue: &mut OutboundQueue, max_batch: usize) -> String {
    let mut frame = String::from(&*first);
    for _ in 1..max_batch {
        match queue.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

async fn send_with_deadline<W>(
    sink: &mut W,
    msg: Message,
    deadline: Duration,
) -> Result<(), WebSocketError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(result) => result.map_err(WebSocketError::from),
        Err(_) => Err(WebSocketError::Timeout(deadline)),
    }
}
