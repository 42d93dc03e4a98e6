//! Full daemon lifecycle: start, drive a capture over the control socket,
//! shut down on signal

use classpulse_daemon::{CaptureSettings, Daemon, DaemonConfig};
use classpulse_metrics::SessionStatus;
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::oneshot;

fn config(tmp: &TempDir) -> DaemonConfig {
    let mut config = DaemonConfig {
        config_path: tmp.path().join("config.toml"),
        capture: CaptureSettings {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exec sleep 30".to_string(), "capture".to_string()],
            stop_timeout_secs: 2.0,
            join_timeout_secs: 1.0,
            ..CaptureSettings::default()
        },
        ..DaemonConfig::default()
    };
    config.sockets.control_socket = Some(tmp.path().join("control.sock"));
    config.sockets.live_socket = Some(tmp.path().join("live.sock"));
    config.storage.database_path = Some(tmp.path().join("events.db"));
    config.storage.fallback_log_path = Some(tmp.path().join("session_data.jsonl"));
    config.aggregator.interval_secs = 3600;
    config
}

async fn request(socket: &std::path::Path, command: &str) -> Value {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", command).as_bytes())
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(10), BufReader::new(reader).lines().next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_shutdown_stops_workers_and_removes_sockets() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let control_socket = tmp.path().join("control.sock");
    let live_socket = tmp.path().join("live.sock");

    let daemon = Daemon::start(&config).await.unwrap();
    assert_eq!(daemon.control_socket_path(), control_socket);
    assert!(live_socket.exists());
    let capture = daemon.capture().clone();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = tokio::spawn(daemon.serve(async move {
        let _ = stop_rx.await;
    }));

    let resp = request(&control_socket, "start cam-1").await;
    assert_eq!(resp["ok"], true);
    let session_id = resp["result"]["id"].as_i64().unwrap();
    assert!(capture.status("cam-1").await.unwrap().is_running);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .expect("shutdown did not finish")
        .unwrap()
        .unwrap();

    assert!(!capture.status("cam-1").await.is_some_and(|s| s.is_running));
    let session = capture.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(!control_socket.exists());
    assert!(!live_socket.exists());
}

#[tokio::test]
async fn test_start_fails_on_unusable_relay_url() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config.relay.url = Some("not a url".to_string());

    assert!(Daemon::start(&config).await.is_err());
    assert!(!tmp.path().join("control.sock").exists());
}
