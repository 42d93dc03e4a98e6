//! Cross-instance publish/subscribe channel
//!
//! A [`Relay`] carries room payloads between every process instance that
//! serves dashboards. [`LocalRelay`] is the in-process implementation; it
//! can be shared by several [`LiveBroadcaster`](crate::LiveBroadcaster)s.
//! [`RedisRelay`](crate::RedisRelay) spans processes.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};

use crate::error::{BroadcasterError, Result};

/// Messages buffered per room before a slow listener starts lagging
pub(crate) const ROOM_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait Relay: Send + Sync {
    /// Fire-and-forget delivery to every listener of the room
    async fn publish(&self, room: &str, payload: String) -> Result<()>;

    async fn subscribe(&self, room: &str) -> Result<RelaySubscription>;

    /// Release one subscription previously taken with [`Relay::subscribe`]
    async fn unsubscribe(&self, room: &str) -> Result<()>;
}

/// Stream of payloads for one room
pub struct RelaySubscription {
    room: String,
    rx: broadcast::Receiver<String>,
}

impl RelaySubscription {
    pub fn new(room: impl Into<String>, rx: broadcast::Receiver<String>) -> Self {
        Self {
            room: room.into(),
            rx,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Next payload, or `None` once the relay closed the room.
    /// Messages missed while lagging are skipped.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(room = %self.room, "Relay listener lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct RoomChannel {
    tx: broadcast::Sender<String>,
    subscriptions: usize,
}

/// In-process relay backed by one broadcast channel per room
pub struct LocalRelay {
    rooms: Mutex<HashMap<String, RoomChannel>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Rooms with at least one live subscription
    pub async fn active_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn publish(&self, room: &str, payload: String) -> Result<()> {
        let rooms = self.rooms.lock().await;
        if let Some(channel) = rooms.get(room) {
            // No listeners is not a failure for a fire-and-forget channel
            let _ = channel.tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<RelaySubscription> {
        let mut rooms = self.rooms.lock().await;
        let channel = rooms.entry(room.to_string()).or_insert_with(|| RoomChannel {
            tx: broadcast::channel(ROOM_CHANNEL_CAPACITY).0,
            subscriptions: 0,
        });
        channel.subscriptions += 1;
        Ok(RelaySubscription::new(room, channel.tx.subscribe()))
    }

    async fn unsubscribe(&self, room: &str) -> Result<()> {
        let mut rooms = self.rooms.lock().await;
        let channel = rooms
            .get_mut(room)
            .ok_or_else(|| BroadcasterError::Relay(format!("no subscription for room {}", room)))?;

        channel.subscriptions = channel.subscriptions.saturating_sub(1);
        if channel.subscriptions == 0 {
            rooms.remove(room);
        }
        Ok(())
    }
}
