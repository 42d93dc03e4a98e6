use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broadcaster::LiveBroadcaster;
use crate::client::{SocketSubscriber, Subscriber};
use crate::error::{BroadcasterError, Result};
use crate::events::LiveEvent;

/// Unix socket endpoint for dashboard clients
///
/// Protocol: the client sends `subscribe <room>` and then receives one JSON
/// object per line. Sending another `subscribe` moves the connection to the
/// new room; closing the connection unsubscribes it.
pub struct LiveServer {
    socket_path: PathBuf,
    broadcaster: Arc<LiveBroadcaster>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<RwLock<bool>>,
}

impl LiveServer {
    pub fn new(socket_path: impl AsRef<Path>, broadcaster: Arc<LiveBroadcaster>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            broadcaster,
            accept_task: Mutex::new(None),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and start accepting dashboard clients
    pub async fn start(&self) -> Result<()> {
        if *self.running.read().await {
            return Err(BroadcasterError::AlreadyRunning);
        }

        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        classpulse_paths::secure_socket_permissions(&self.socket_path)
            .map_err(|e| BroadcasterError::SocketPath(e.to_string()))?;

        tracing::info!("Live server started on {:?} (permissions: 0600)", self.socket_path);

        *self.running.write().await = true;

        let broadcaster = Arc::clone(&self.broadcaster);
        let running = Arc::clone(&self.running);

        let task = tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }

                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let broadcaster = Arc::clone(&broadcaster);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, broadcaster).await {
                                tracing::debug!("Live connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept live client: {}", e);
                    }
                }
            }
            tracing::info!("Live accept task stopped");
        });

        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Stop accepting clients and remove the socket file
    pub async fn stop(&self) -> Result<()> {
        if !*self.running.read().await {
            return Err(BroadcasterError::NotStarted);
        }

        *self.running.write().await = false;

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        tracing::info!("Live server stopped");
        Ok(())
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        if let Ok(running) = self.running.try_read() {
            if *running && self.socket_path.exists() {
                let _ = std::fs::remove_file(&self.socket_path);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, broadcaster: Arc<LiveBroadcaster>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let subscriber = Arc::new(SocketSubscriber::new(writer));
    let mut lines = BufReader::new(reader).lines();
    let mut current_room: Option<String> = None;

    let result = async {
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let reply = match line.split_once(char::is_whitespace) {
                Some(("subscribe", room)) if !room.trim().is_empty() => {
                    let room = room.trim().to_string();
                    if let Some(previous) = current_room.take() {
                        broadcaster.unsubscribe(&previous, subscriber.id()).await?;
                    }
                    broadcaster.subscribe(&room, subscriber.clone()).await?;
                    current_room = Some(room.clone());
                    LiveEvent::Subscribed { room }
                }
                _ => LiveEvent::Error {
                    message: format!("unknown command: {}", line),
                },
            };

            subscriber.send(&reply.to_json()?).await?;
        }
        Ok::<(), BroadcasterError>(())
    }
    .await;

    if let Some(room) = current_room {
        broadcaster.unsubscribe(&room, subscriber.id()).await?;
    }

    result
}
