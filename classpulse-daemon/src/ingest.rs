//! Event ingestion: validate, persist (or fall back), then publish

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classpulse_broadcaster::{LiveBroadcaster, LiveEvent};
use classpulse_metrics::{EventDatabase, RawFrameEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// Durable sink for telemetry records
#[async_trait]
pub trait EventStorage: Send + Sync {
    async fn append(&self, ts: DateTime<Utc>, event: &RawFrameEvent) -> Result<()>;
}

/// [`EventStorage`] backed by the SQLite event database
pub struct SqliteStorage {
    db: Arc<EventDatabase>,
}

impl SqliteStorage {
    pub fn new(db: Arc<EventDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventStorage for SqliteStorage {
    async fn append(&self, ts: DateTime<Utc>, event: &RawFrameEvent) -> Result<()> {
        let db = Arc::clone(&self.db);
        let event = event.clone();
        tokio::task::spawn_blocking(move || db.insert_event(ts, &event))
            .await
            .context("storage task failed")??;
        Ok(())
    }
}

/// Append-only JSONL file that receives events the storage rejected
pub struct FallbackLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FallbackLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON record as a line
    pub async fn append_line(&self, record: &Value) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Events waiting for the publisher before new ones are dropped
const PUBLISH_QUEUE_CAPACITY: usize = 4096;

/// Bound on one relay publish before the publisher moves on
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub persisted: bool,
    /// Handed to the publisher; delivery itself is best-effort
    pub published: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub inserted_count: usize,
    pub failed_count: usize,
}

/// Persists each record and republishes it to its device room
///
/// Publishing runs on a background task fed through a bounded queue, so a
/// slow or unreachable relay never holds up ingestion. Queue order is
/// publish order.
pub struct EventRouter {
    storage: Arc<dyn EventStorage>,
    fallback: FallbackLog,
    broadcaster: Arc<LiveBroadcaster>,
    publish_tx: mpsc::Sender<LiveEvent>,
}

impl EventRouter {
    /// Must be called inside a tokio runtime; spawns the publisher task.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        fallback: FallbackLog,
        broadcaster: Arc<LiveBroadcaster>,
    ) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        tokio::spawn(run_publisher(Arc::clone(&broadcaster), publish_rx));

        Self {
            storage,
            fallback,
            broadcaster,
            publish_tx,
        }
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    /// Queue an event for its room without waiting on the relay. False when
    /// the queue is full or the publisher is gone.
    pub fn publish(&self, event: LiveEvent) -> bool {
        match self.publish_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(room = ?event.room(), "Publish queue full, dropping live event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Publisher stopped, dropping live event");
                false
            }
        }
    }

    /// Ingest to the room named by the record's own `source_device`
    pub async fn ingest_one(&self, event: RawFrameEvent) -> IngestOutcome {
        let room = event.source_device.clone();
        self.ingest_to(&room, event).await
    }

    /// Persist one validated record, falling back to the local log when
    /// storage fails, and queue it for `room` when persisted.
    pub async fn ingest_to(&self, room: &str, mut event: RawFrameEvent) -> IngestOutcome {
        let ts = event.resolved_timestamp(Utc::now());
        event.timestamp = Some(ts.to_rfc3339());

        if let Err(e) = self.storage.append(ts, &event).await {
            error!(device_id = %event.source_device, "Failed to persist event: {:#}", e);
            self.write_fallback(&event).await;
            return IngestOutcome {
                persisted: false,
                published: false,
            };
        }

        let published = self.publish(LiveEvent::Frame {
            device_id: room.to_string(),
            event,
        });

        IngestOutcome {
            persisted: true,
            published,
        }
    }

    /// Decode, validate and ingest a JSON record
    pub async fn ingest_value(&self, value: Value) -> classpulse_metrics::Result<IngestOutcome> {
        let event = RawFrameEvent::from_value(value)?;
        Ok(self.ingest_one(event).await)
    }

    /// Ingest records in order. Invalid or unpersisted records count as failed.
    pub async fn ingest_batch(&self, values: Vec<Value>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for value in values {
            match self.ingest_value(value).await {
                Ok(IngestOutcome { persisted: true, .. }) => outcome.inserted_count += 1,
                Ok(_) => outcome.failed_count += 1,
                Err(e) => {
                    debug!("Rejected event in batch: {}", e);
                    outcome.failed_count += 1;
                }
            }
        }
        outcome
    }

    async fn write_fallback(&self, event: &RawFrameEvent) {
        let record = match serde_json::to_value(event) {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to encode fallback record: {}", e);
                return;
            }
        };
        if let Err(e) = self.fallback.append_line(&record).await {
            error!(path = %self.fallback.path().display(), "Failed to write fallback log: {:#}", e);
        }
    }
}

async fn run_publisher(broadcaster: Arc<LiveBroadcaster>, mut rx: mpsc::Receiver<LiveEvent>) {
    while let Some(event) = rx.recv().await {
        match tokio::time::timeout(PUBLISH_TIMEOUT, broadcaster.publish_event(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(room = ?event.room(), "Failed to publish event: {}", e),
            Err(_) => warn!(room = ?event.room(), "Relay publish timed out after {:?}", PUBLISH_TIMEOUT),
        }
    }
    debug!("Publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use classpulse_broadcaster::{ChannelSubscriber, LocalRelay, Relay, RelaySubscription};
    use serde_json::json;
    use tempfile::TempDir;

    /// Relay whose publish never completes, as when the network peer hangs
    struct HangingRelay {
        inner: LocalRelay,
    }

    #[async_trait]
    impl Relay for HangingRelay {
        async fn publish(&self, _room: &str, _payload: String) -> classpulse_broadcaster::Result<()> {
            std::future::pending().await
        }

        async fn subscribe(&self, room: &str) -> classpulse_broadcaster::Result<RelaySubscription> {
            self.inner.subscribe(room).await
        }

        async fn unsubscribe(&self, room: &str) -> classpulse_broadcaster::Result<()> {
            self.inner.unsubscribe(room).await
        }
    }

    struct RejectingStorage;

    #[async_trait]
    impl EventStorage for RejectingStorage {
        async fn append(&self, _ts: DateTime<Utc>, _event: &RawFrameEvent) -> Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    fn record(device: &str, n: u32) -> Value {
        json!({
            "timestamp": "not a timestamp",
            "emotion": "Neutral",
            "emotion_confidence": 0.6,
            "probabilities": {"Neutral": 0.6, "Happy": 0.4},
            "student_id": format!("s{}", n),
            "source_device": device
        })
    }

    fn router_with(storage: Arc<dyn EventStorage>, tmp: &TempDir) -> EventRouter {
        EventRouter::new(
            storage,
            FallbackLog::new(tmp.path().join("session_data.jsonl")),
            Arc::new(LiveBroadcaster::new(Arc::new(LocalRelay::new()))),
        )
    }

    #[tokio::test]
    async fn test_persisted_event_is_published() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(EventDatabase::new(tmp.path().join("events.db")).unwrap());
        let router = router_with(Arc::new(SqliteStorage::new(db.clone())), &tmp);

        let (sub, mut rx) = ChannelSubscriber::new();
        router
            .broadcaster()
            .subscribe("cam-1", Arc::new(sub))
            .await
            .unwrap();

        let outcome = router.ingest_value(record("cam-1", 1)).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome {
                persisted: true,
                published: true
            }
        );
        assert_eq!(db.count_events().unwrap(), 1);

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let live: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(live["type"], "frame");
        // Unparseable timestamp replaced with receipt time
        let ts = live["event"]["timestamp"].as_str().unwrap();
        assert!(classpulse_metrics::parse_timestamp(ts).is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_goes_to_fallback_log() {
        let tmp = TempDir::new().unwrap();
        let router = router_with(Arc::new(RejectingStorage), &tmp);

        let outcome = router.ingest_value(record("cam-1", 1)).await.unwrap();
        assert!(!outcome.persisted);
        assert!(!outcome.published);

        let contents = std::fs::read_to_string(tmp.path().join("session_data.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let saved: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(saved["student_id"], "s1");
    }

    #[tokio::test]
    async fn test_batch_counts_invalid_records() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(EventDatabase::new(tmp.path().join("events.db")).unwrap());
        let router = router_with(Arc::new(SqliteStorage::new(db.clone())), &tmp);

        let outcome = router
            .ingest_batch(vec![
                record("cam-1", 1),
                json!({"emotion": "Happy"}),
                record("cam-1", 2),
                json!("not an object"),
            ])
            .await;
        assert_eq!(
            outcome,
            BatchOutcome {
                inserted_count: 2,
                failed_count: 2
            }
        );

        let stored = db.recent_events("cam-1", 10).unwrap();
        let students: Vec<_> = stored.iter().map(|e| e.student_id.clone().unwrap()).collect();
        assert_eq!(students, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_hung_relay_does_not_block_ingestion() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(EventDatabase::new(tmp.path().join("events.db")).unwrap());
        let relay = Arc::new(HangingRelay {
            inner: LocalRelay::new(),
        });
        let router = EventRouter::new(
            Arc::new(SqliteStorage::new(db.clone())),
            FallbackLog::new(tmp.path().join("session_data.jsonl")),
            Arc::new(LiveBroadcaster::new(relay)),
        );

        let ingest_all = async {
            for n in 0..5 {
                let outcome = router.ingest_value(record("cam-1", n)).await.unwrap();
                assert!(outcome.persisted);
                assert!(outcome.published);
            }
        };
        tokio::time::timeout(Duration::from_secs(2), ingest_all)
            .await
            .expect("ingestion waited on the relay");
        assert_eq!(db.count_events().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_ingest_to_overrides_room() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(EventDatabase::new(tmp.path().join("events.db")).unwrap());
        let router = router_with(Arc::new(SqliteStorage::new(db)), &tmp);

        let (sub, mut rx) = ChannelSubscriber::new();
        router
            .broadcaster()
            .subscribe("room-101", Arc::new(sub))
            .await
            .unwrap();

        let event = RawFrameEvent::from_value(record("cam-1", 1)).unwrap();
        router.ingest_to("room-101", event).await;

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let live: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(live["device_id"], "room-101");
    }
}
