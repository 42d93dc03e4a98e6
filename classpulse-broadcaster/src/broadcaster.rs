use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{RoomRegistry, Subscriber};
use crate::error::Result;
use crate::events::LiveEvent;
use crate::relay::{Relay, RelaySubscription};

struct Forwarder {
    generation: u64,
    task: JoinHandle<()>,
}

type Forwarders = Arc<Mutex<HashMap<String, Forwarder>>>;

/// Room-based fan-out to local subscribers, fed through a [`Relay`]
///
/// Publishing goes to the relay only. Each room with local subscribers has
/// one forwarding task that listens on the relay and rebroadcasts to them,
/// so subscribers on any instance sharing the relay see every message.
pub struct LiveBroadcaster {
    registry: Arc<RoomRegistry>,
    relay: Arc<dyn Relay>,
    // Lock order: forwarders, then registry
    forwarders: Forwarders,
    next_generation: AtomicU64,
}

impl LiveBroadcaster {
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            relay,
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Add a subscriber to a room, starting the room's forwarder if it has none
    pub async fn subscribe(&self, room: &str, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let mut forwarders = self.forwarders.lock().await;

        let running = forwarders
            .get(room)
            .is_some_and(|f| !f.task.is_finished());
        if !running {
            let subscription = self.relay.subscribe(room).await?;
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let task = tokio::spawn(run_forwarder(
                generation,
                subscription,
                Arc::clone(&self.registry),
                Arc::clone(&self.relay),
                Arc::clone(&self.forwarders),
            ));
            forwarders.insert(room.to_string(), Forwarder { generation, task });
            tracing::info!(room = %room, "Started relay forwarder");
        }

        self.registry.add(room, subscriber).await;
        Ok(())
    }

    /// Remove a subscriber; the room's forwarder stops once the room is empty
    pub async fn unsubscribe(&self, room: &str, id: Uuid) -> Result<()> {
        let mut forwarders = self.forwarders.lock().await;

        if self.registry.remove(room, id).await > 0 {
            return Ok(());
        }

        if let Some(forwarder) = forwarders.remove(room) {
            forwarder.task.abort();
            self.relay.unsubscribe(room).await?;
            tracing::info!(room = %room, "Stopped relay forwarder");
        }
        Ok(())
    }

    /// Send a raw payload to the room on every instance (fire-and-forget)
    pub async fn publish(&self, room: &str, payload: String) -> Result<()> {
        self.relay.publish(room, payload).await
    }

    /// Serialize and publish an event to its room
    pub async fn publish_event(&self, event: &LiveEvent) -> Result<()> {
        let Some(room) = event.room() else {
            return Ok(());
        };
        let payload = event.to_json()?;
        self.publish(room, payload).await
    }

    pub async fn subscriber_count(&self, room: &str) -> usize {
        self.registry.room_len(room).await
    }

    /// Rooms that currently have a forwarding task
    pub async fn forwarder_count(&self) -> usize {
        self.forwarders
            .lock()
            .await
            .values()
            .filter(|f| !f.task.is_finished())
            .count()
    }

    /// Stop every forwarder and release its relay subscription
    pub async fn shutdown(&self) {
        let mut forwarders = self.forwarders.lock().await;
        for (room, forwarder) in forwarders.drain() {
            forwarder.task.abort();
            if let Err(e) = self.relay.unsubscribe(&room).await {
                tracing::warn!(room = %room, "Failed to release relay subscription: {}", e);
            }
        }
    }
}

async fn run_forwarder(
    generation: u64,
    mut subscription: RelaySubscription,
    registry: Arc<RoomRegistry>,
    relay: Arc<dyn Relay>,
    forwarders: Forwarders,
) {
    let room = subscription.room().to_string();

    loop {
        let payload = subscription.recv().await;
        if let Some(payload) = &payload {
            registry.broadcast(&room, payload).await;
        }

        let mut map = forwarders.lock().await;
        // A newer forwarder, or an unsubscribe, already owns this room
        if map.get(&room).map(|f| f.generation) != Some(generation) {
            return;
        }
        if payload.is_some() && registry.room_len(&room).await > 0 {
            continue;
        }

        map.remove(&room);
        drop(subscription);
        if let Err(e) = relay.unsubscribe(&room).await {
            tracing::warn!(room = %room, "Failed to release relay subscription: {}", e);
        }
        tracing::info!(room = %room, "Relay forwarder finished");
        return;
    }
}
