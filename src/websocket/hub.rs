//! Room registry and broadcaster.
//!
//! Every membership change and every fan-out goes through one control loop,
//! so a room's member set is only ever touched by a single task. Diagnostics
//! read a snapshot under the shared side of the same lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{RoomId, UserId};
use crate::websocket::message::{ClientId, Envelope, ServerMessage};

/// Serialized events waiting to be written to one connection.
pub type OutboundQueue = mpsc::Receiver<Arc<str>>;

/// Identity of a live connection inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub username: String,
    pub room_id: RoomId,
}

impl ClientInfo {
    pub fn new(user_id: UserId, username: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user_id,
            username: username.into(),
            room_id,
        }
    }

    fn join_event(&self) -> ServerMessage {
        ServerMessage::Join {
            room_id: self.room_id,
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }

    fn leave_event(&self) -> ServerMessage {
        ServerMessage::Leave {
            room_id: self.room_id,
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

/// A registered connection. Holds the only strong sender of its outbound
/// queue, so dropping it closes the queue.
#[derive(Debug)]
pub struct Client {
    info: ClientInfo,
    queue: mpsc::Sender<Arc<str>>,
}

impl Client {
    pub fn new(info: ClientInfo, capacity: usize) -> (Self, OutboundQueue) {
        let (queue, rx) = mpsc::channel(capacity);
        (Self { info, queue }, rx)
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }
}

type Rooms = HashMap<RoomId, HashMap<ClientId, Client>>;

enum Command {
    Register(Client),
    Unregister { room_id: RoomId, client_id: ClientId },
    Broadcast(Envelope),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the hub's control loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    rooms: Arc<RwLock<Rooms>>,
}

impl Hub {
    /// Starts the control loop on the current runtime. The loop stops once
    /// every handle has been dropped.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let rooms = Arc::new(RwLock::new(Rooms::new()));
        tokio::spawn(run(rx, rooms.clone()));
        info!("Hub control loop started");
        Self { commands, rooms }
    }

    /// Adds the client to its room and announces it to everyone there,
    /// the client included. Call once per client.
    pub fn register(&self, client: Client) {
        self.submit(Command::Register(client));
    }

    /// Removes the client and closes its queue. Safe to call repeatedly.
    pub fn unregister(&self, client: &ClientInfo) {
        self.submit(Command::Unregister {
            room_id: client.room_id,
            client_id: client.client_id,
        });
    }

    pub fn broadcast(&self, envelope: Envelope) {
        self.submit(Command::Broadcast(envelope));
    }

    /// Queues an event for one client only. A client that cannot take it is
    /// evicted like any other slow member.
    pub fn send_to(&self, client: &ClientInfo, event: ServerMessage) {
        self.broadcast(Envelope::new(event).only(client.client_id));
    }

    /// Resolves once every request submitted before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Flush(tx));
        let _ = rx.await;
    }

    pub async fn room_clients(&self, room_id: RoomId) -> Vec<ClientInfo> {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map(|members| members.values().map(|c| c.info.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn room_client_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .read()
            .await
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn client_count(&self) -> usize {
        self.rooms.read().await.values().map(HashMap::len).sum()
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Hub control loop has stopped, dropping request");
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, shared: Arc<RwLock<Rooms>>) {
    while let Some(command) = commands.recv().await {
        let mut rooms = shared.write().await;
        match command {
            Command::Register(client) => {
                let info = client.info.clone();
                rooms
                    .entry(info.room_id)
                    .or_default()
                    .insert(info.client_id, client);
                info!(
                    client_id = %info.client_id,
                    user_id = info.user_id,
                    room_id = info.room_id,
                    "{} joined room", info.username
                );
                fan_out(&mut rooms, Envelope::new(info.join_event()));
            }
            Command::Unregister { room_id, client_id } => {
                let Some(client) = remove_member(&mut rooms, room_id, client_id) else {
                    debug!(%client_id, room_id, "Unregister for a client that is already gone");
                    continue;
                };
                info!(
                    %client_id,
                    user_id = client.info.user_id,
                    room_id,
                    "{} left room", client.info.username
                );
                let leave = client.info.leave_event();
                drop(client);
                fan_out(&mut rooms, Envelope::new(leave));
            }
            Command::Broadcast(envelope) => fan_out(&mut rooms, envelope),
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Hub control loop stopped");
}

/// Drops the member and, with it, the room once nobody is left.
fn remove_member(rooms: &mut Rooms, room_id: RoomId, client_id: ClientId) -> Option<Client> {
    let members = rooms.get_mut(&room_id)?;
    let client = members.remove(&client_id)?;
    if members.is_empty() {
        rooms.remove(&room_id);
    }
    Some(client)
}

/// Best-effort delivery. A member whose queue is full or closed is evicted on
/// the spot and the rest of the room still gets the event; the eviction is
/// then announced as a leave.
fn fan_out(rooms: &mut Rooms, envelope: Envelope) {
    let mut pending = VecDeque::from([envelope]);

    while let Some(envelope) = pending.pop_front() {
        let Some(members) = rooms.get(&envelope.room_id) else {
            continue;
        };

        let payload: Arc<str> = match serde_json::to_string(&envelope.event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(room_id = envelope.room_id, error = %e, "Failed to serialize event");
                continue;
            }
        };

        let mut evicted = Vec::new();
        for (client_id, client) in members {
            if !envelope.reaches(client_id) {
                continue;
            }
            match client.queue.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(%client_id, room_id = envelope.room_id, "Outbound queue full, evicting client");
                    evicted.push(*client_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(%client_id, room_id = envelope.room_id, "Outbound queue closed, evicting client");
                    evicted.push(*client_id);
                }
            }
        }

        for client_id in evicted {
            if let Some(client) = remove_member(rooms, envelope.room_id, client_id) {
                pending.push_back(Envelope::new(client.info.leave_event()));
            }
        }
    }
}
