use async_trait::async_trait;
use classpulse_broadcaster::{
    BroadcasterError, ChannelSubscriber, LiveBroadcaster, LiveServer, LocalRelay, Subscriber,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;

/// Subscriber whose every send fails
struct BrokenSubscriber {
    id: Uuid,
    attempts: AtomicUsize,
}

#[async_trait]
impl Subscriber for BrokenSubscriber {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send(&self, _text: &str) -> classpulse_broadcaster::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BroadcasterError::SubscriberClosed(self.id))
    }
}

async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_failed_subscriber_does_not_block_others() {
    let broadcaster = LiveBroadcaster::new(Arc::new(LocalRelay::new()));

    let broken = Arc::new(BrokenSubscriber {
        id: Uuid::new_v4(),
        attempts: AtomicUsize::new(0),
    });
    let (healthy, mut rx) = ChannelSubscriber::new();

    broadcaster.subscribe("cam-1", broken.clone()).await.unwrap();
    broadcaster.subscribe("cam-1", Arc::new(healthy)).await.unwrap();

    broadcaster.publish("cam-1", "first".to_string()).await.unwrap();
    broadcaster.publish("cam-1", "second".to_string()).await.unwrap();

    assert_eq!(recv(&mut rx).await.as_deref(), Some("first"));
    assert_eq!(recv(&mut rx).await.as_deref(), Some("second"));

    // Removed after the first failed pass
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broadcaster.subscriber_count("cam-1").await, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let broadcaster = LiveBroadcaster::new(Arc::new(LocalRelay::new()));
    let (a, mut rx_a) = ChannelSubscriber::new();
    let (b, mut rx_b) = ChannelSubscriber::new();
    broadcaster.subscribe("cam-1", Arc::new(a)).await.unwrap();
    broadcaster.subscribe("cam-2", Arc::new(b)).await.unwrap();

    broadcaster.publish("cam-2", "for-b".to_string()).await.unwrap();
    assert_eq!(recv(&mut rx_b).await.as_deref(), Some("for-b"));
    assert!(tokio::time::timeout(Duration::from_millis(100), rx_a.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_relay_reaches_subscribers_of_other_instances() {
    let relay = Arc::new(LocalRelay::new());
    let ingesting = LiveBroadcaster::new(relay.clone());
    let serving = LiveBroadcaster::new(relay.clone());

    let (sub, mut rx) = ChannelSubscriber::new();
    serving.subscribe("cam-1", Arc::new(sub)).await.unwrap();

    ingesting.publish("cam-1", "relayed".to_string()).await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some("relayed"));
    assert_eq!(ingesting.forwarder_count().await, 0);
}

#[tokio::test]
async fn test_per_room_order_is_preserved() {
    let broadcaster = LiveBroadcaster::new(Arc::new(LocalRelay::new()));
    let (sub, mut rx) = ChannelSubscriber::new();
    broadcaster.subscribe("cam-1", Arc::new(sub)).await.unwrap();

    for i in 0..20 {
        broadcaster.publish("cam-1", i.to_string()).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(recv(&mut rx).await, Some(i.to_string()));
    }
}

#[tokio::test]
async fn test_live_server_lifecycle() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("live.sock");

    let broadcaster = Arc::new(LiveBroadcaster::new(Arc::new(LocalRelay::new())));
    let server = LiveServer::new(&socket_path, broadcaster);

    server.start().await.unwrap();
    assert!(socket_path.exists());
    assert!(server.start().await.is_err());

    server.stop().await.unwrap();
    assert!(!socket_path.exists());
    assert!(server.stop().await.is_err());
}

#[tokio::test]
async fn test_socket_client_subscribes_and_receives() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("live_sub.sock");

    let broadcaster = Arc::new(LiveBroadcaster::new(Arc::new(LocalRelay::new())));
    let server = LiveServer::new(&socket_path, broadcaster.clone());
    server.start().await.unwrap();

    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"subscribe room-101\n").await.unwrap();
    let ack = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ack: serde_json::Value = serde_json::from_str(&ack).unwrap();
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["room"], "room-101");

    broadcaster
        .publish("room-101", "{\"type\":\"frame\"}".to_string())
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(line, "{\"type\":\"frame\"}");

    // Disconnect releases the subscription
    drop(writer);
    drop(lines);
    for _ in 0..50 {
        if broadcaster.subscriber_count("room-101").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broadcaster.subscriber_count("room-101").await, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_gets_error_reply() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("live_err.sock");

    let broadcaster = Arc::new(LiveBroadcaster::new(Arc::new(LocalRelay::new())));
    let server = LiveServer::new(&socket_path, broadcaster);
    server.start().await.unwrap();

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(b"dance\n").await.unwrap();

    let mut reader = BufReader::new(&mut stream);
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply["type"], "error");

    server.stop().await.unwrap();
}
