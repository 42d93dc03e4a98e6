//! Redis pub/sub relay
//!
//! Each room maps to the Redis channel `live:<room>`, so every process
//! instance pointed at the same server shares its rooms. One pub/sub
//! connection is held per room with local subscriptions; publishing goes
//! over a shared multiplexed connection.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::error::{BroadcasterError, Result};
use crate::relay::{Relay, RelaySubscription, ROOM_CHANNEL_CAPACITY};

/// Prefix for every room channel on the server
pub const CHANNEL_PREFIX: &str = "live:";

pub fn channel_name(room: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, room)
}

struct RoomListener {
    generation: u64,
    tx: broadcast::Sender<String>,
    task: JoinHandle<()>,
    subscriptions: usize,
}

type Listeners = Arc<Mutex<HashMap<String, RoomListener>>>;

pub struct RedisRelay {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
    rooms: Listeners,
    next_generation: AtomicU64,
}

impl RedisRelay {
    /// Parse the server URL. No connection is made until first use.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            publisher: Mutex::new(None),
            rooms: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Rooms with a live pub/sub listener
    pub async fn active_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, room: &str, payload: String) -> Result<()> {
        let mut publisher = self.publisher.lock().await;
        let mut conn = match publisher.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        // A failed connection is dropped and replaced on the next publish
        let _: i64 = conn.publish(channel_name(room), payload).await?;
        *publisher = Some(conn);
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<RelaySubscription> {
        let mut rooms = self.rooms.lock().await;

        if let Some(listener) = rooms.get_mut(room) {
            if !listener.task.is_finished() {
                listener.subscriptions += 1;
                return Ok(RelaySubscription::new(room, listener.tx.subscribe()));
            }
        }

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_name(room)).await?;

        let (tx, rx) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(listen(
            room.to_string(),
            generation,
            pubsub,
            tx.clone(),
            Arc::clone(&self.rooms),
        ));
        rooms.insert(
            room.to_string(),
            RoomListener {
                generation,
                tx,
                task,
                subscriptions: 1,
            },
        );
        tracing::debug!(room = %room, channel = %channel_name(room), "Subscribed to Redis channel");

        Ok(RelaySubscription::new(room, rx))
    }

    async fn unsubscribe(&self, room: &str) -> Result<()> {
        let mut rooms = self.rooms.lock().await;
        let listener = rooms
            .get_mut(room)
            .ok_or_else(|| BroadcasterError::Relay(format!("no subscription for room {}", room)))?;

        listener.subscriptions = listener.subscriptions.saturating_sub(1);
        if listener.subscriptions == 0 {
            if let Some(listener) = rooms.remove(room) {
                listener.task.abort();
            }
        }
        Ok(())
    }
}

async fn listen(
    room: String,
    generation: u64,
    pubsub: redis::aio::PubSub,
    tx: broadcast::Sender<String>,
    rooms: Listeners,
) {
    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        match msg.get_payload::<String>() {
            Ok(payload) => {
                let _ = tx.send(payload);
            }
            Err(e) => tracing::warn!(room = %room, "Dropping undecodable relay payload: {}", e),
        }
    }

    tracing::warn!(room = %room, "Redis subscription ended");
    // Dropping the last sender closes every subscription of this room
    let mut rooms = rooms.lock().await;
    if rooms.get(&room).is_some_and(|l| l.generation == generation) {
        rooms.remove(&room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChannelSubscriber;
    use crate::LiveBroadcaster;
    use std::time::Duration;

    // Nothing listens on port 1
    const UNREACHABLE: &str = "redis://127.0.0.1:1/";

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("cam-1"), "live:cam-1");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RedisRelay::new("not a url").is_err());
        assert!(RedisRelay::new(UNREACHABLE).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let relay = RedisRelay::new(UNREACHABLE).unwrap();
        assert!(relay.publish("cam-1", "x".to_string()).await.is_err());
        assert!(relay.subscribe("cam-1").await.is_err());
        assert_eq!(relay.active_rooms().await, 0);
        assert!(relay.unsubscribe("cam-1").await.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires a Redis server (CLASSPULSE_REDIS_URL)"]
    async fn test_rooms_are_shared_between_instances() {
        let url = std::env::var("CLASSPULSE_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let a = LiveBroadcaster::new(Arc::new(RedisRelay::new(&url).unwrap()));
        let b = LiveBroadcaster::new(Arc::new(RedisRelay::new(&url).unwrap()));

        let (sub, mut rx) = ChannelSubscriber::new();
        b.subscribe("classpulse-test-room", Arc::new(sub)).await.unwrap();

        a.publish("classpulse-test-room", "{\"n\":1}".to_string())
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "{\"n\":1}");

        b.shutdown().await;
    }
}
