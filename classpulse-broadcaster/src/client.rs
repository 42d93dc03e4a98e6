use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{BroadcasterError, Result};

/// A live dashboard connection that can receive text payloads
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> Uuid;

    /// Deliver one payload. An error marks the subscriber as dead.
    async fn send(&self, text: &str) -> Result<()>;
}

/// Subscriber writing newline-delimited payloads to a Unix socket
pub struct SocketSubscriber {
    id: Uuid,
    writer: Mutex<OwnedWriteHalf>,
}

impl SocketSubscriber {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Subscriber for SocketSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }
}

/// Subscriber forwarding payloads into an in-process channel
pub struct ChannelSubscriber {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, text: &str) -> Result<()> {
        self.tx
            .send(text.to_string())
            .map_err(|_| BroadcasterError::SubscriberClosed(self.id))
    }
}

type Room = HashMap<Uuid, Arc<dyn Subscriber>>;

/// Thread-safe room → subscriber set registry
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add a subscriber to a room. Returns the room's new size.
    pub async fn add(&self, room: &str, subscriber: Arc<dyn Subscriber>) -> usize {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        members.insert(subscriber.id(), subscriber);
        tracing::info!(room = %room, "Subscriber joined. Room size: {}", members.len());
        members.len()
    }

    /// Remove a subscriber. Returns the number of subscribers left in the room.
    pub async fn remove(&self, room: &str, id: Uuid) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return 0;
        };
        members.remove(&id);
        let remaining = members.len();
        if remaining == 0 {
            rooms.remove(room);
        }
        remaining
    }

    pub async fn room_len(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, |m| m.len())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Send a payload to every subscriber in the room, removing dead ones
    /// after the pass. Returns the number of successful deliveries.
    pub async fn broadcast(&self, room: &str, payload: &str) -> usize {
        let snapshot: Vec<Arc<dyn Subscriber>> = match self.rooms.read().await.get(room) {
            Some(members) => members.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for subscriber in snapshot {
            match subscriber.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(room = %room, "Failed to send to subscriber {}: {}", subscriber.id(), e);
                    dead.push(subscriber.id());
                }
            }
        }

        for id in dead {
            let remaining = self.remove(room, id).await;
            tracing::info!(room = %room, "Removed dead subscriber. Remaining: {}", remaining);
        }

        delivered
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
