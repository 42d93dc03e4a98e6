//! Unix socket control server
//!
//! One text command per line, one JSON response per line:
//!
//! - `start <device_id> [json-config]`
//! - `stop <session_id>`
//! - `stop-device <device_id>`
//! - `status [device_id]`
//! - `sessions [limit]`
//! - `ingest <json object or array>`
//! - `alerts [limit]`
//! - `aggregates <student_id>`
//! - `events <device_id> [limit]`

use anyhow::{anyhow, bail, Context, Result};
use classpulse_metrics::EventDatabase;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::capture::{CaptureService, DEFAULT_SESSION_LIMIT};
use crate::ingest::EventRouter;

/// Alerts listed when no limit is given
pub const DEFAULT_ALERT_LIMIT: usize = 50;

/// Stored events listed per device when no limit is given
pub const DEFAULT_EVENT_LIMIT: usize = 100;

fn parse_limit(arg: &str, default: usize, usage: &str) -> Result<usize> {
    if arg.is_empty() {
        return Ok(default);
    }
    arg.parse().map_err(|_| anyhow!("Usage: {}", usage))
}

/// Control command
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start { device_id: String, config: Value },
    Stop { session_id: i64 },
    StopDevice { device_id: String },
    Status { device_id: Option<String> },
    Sessions { limit: usize },
    Ingest { payload: Value },
    Alerts { limit: usize },
    Aggregates { student_id: String },
    Events { device_id: String, limit: usize },
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_lowercase().as_str() {
            "start" => {
                let (device_id, config) = match rest.split_once(char::is_whitespace) {
                    Some((device_id, config)) => (device_id, config.trim()),
                    None => (rest, ""),
                };
                if device_id.is_empty() {
                    bail!("Usage: start <device_id> [json-config]");
                }
                let config = if config.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(config).context("Invalid config JSON")?
                };
                Ok(Self::Start {
                    device_id: device_id.to_string(),
                    config,
                })
            }
            "stop" => {
                let session_id = rest
                    .parse()
                    .map_err(|_| anyhow!("Usage: stop <session_id>"))?;
                Ok(Self::Stop { session_id })
            }
            "stop-device" => {
                if rest.is_empty() {
                    bail!("Usage: stop-device <device_id>");
                }
                Ok(Self::StopDevice {
                    device_id: rest.to_string(),
                })
            }
            "status" => Ok(Self::Status {
                device_id: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "sessions" => Ok(Self::Sessions {
                limit: parse_limit(rest, DEFAULT_SESSION_LIMIT, "sessions [limit]")?,
            }),
            "ingest" => {
                let payload = serde_json::from_str(rest).context("Invalid event JSON")?;
                Ok(Self::Ingest { payload })
            }
            "alerts" => Ok(Self::Alerts {
                limit: parse_limit(rest, DEFAULT_ALERT_LIMIT, "alerts [limit]")?,
            }),
            "aggregates" => {
                if rest.is_empty() || rest.contains(char::is_whitespace) {
                    bail!("Usage: aggregates <student_id>");
                }
                Ok(Self::Aggregates {
                    student_id: rest.to_string(),
                })
            }
            "events" => {
                const USAGE: &str = "events <device_id> [limit]";
                let (device_id, limit) = match rest.split_once(char::is_whitespace) {
                    Some((device_id, limit)) => (device_id, limit.trim()),
                    None => (rest, ""),
                };
                if device_id.is_empty() {
                    bail!("Usage: {}", USAGE);
                }
                Ok(Self::Events {
                    device_id: device_id.to_string(),
                    limit: parse_limit(limit, DEFAULT_EVENT_LIMIT, USAGE)?,
                })
            }
            _ => bail!("Unknown command: {}", verb),
        }
    }
}

/// Services the control socket drives
pub struct ControlContext {
    pub capture: Arc<CaptureService>,
    pub router: Arc<EventRouter>,
    pub db: Arc<EventDatabase>,
}

impl ControlContext {
    pub async fn execute(&self, command: ControlCommand) -> Result<Value> {
        match command {
            ControlCommand::Start { device_id, config } => {
                let session = self.capture.start_capture(&device_id, config).await?;
                Ok(serde_json::to_value(session)?)
            }
            ControlCommand::Stop { session_id } => {
                let session = self.capture.stop_capture(session_id).await?;
                Ok(serde_json::to_value(session)?)
            }
            ControlCommand::StopDevice { device_id } => {
                let stopped = self.capture.stop_device(&device_id).await?;
                Ok(json!({ "device_id": device_id, "stopped": stopped }))
            }
            ControlCommand::Status { device_id: Some(device_id) } => {
                let status = self
                    .capture
                    .status(&device_id)
                    .await
                    .ok_or_else(|| anyhow!("No capture worker for device {}", device_id))?;
                Ok(serde_json::to_value(status)?)
            }
            ControlCommand::Status { device_id: None } => {
                Ok(serde_json::to_value(self.capture.all_status().await)?)
            }
            ControlCommand::Sessions { limit } => {
                Ok(serde_json::to_value(self.capture.list_sessions(limit).await?)?)
            }
            ControlCommand::Ingest { payload: Value::Array(events) } => {
                Ok(serde_json::to_value(self.router.ingest_batch(events).await)?)
            }
            ControlCommand::Ingest { payload } => {
                Ok(serde_json::to_value(self.router.ingest_value(payload).await?)?)
            }
            ControlCommand::Alerts { limit } => {
                let alerts = self.query(move |db| db.recent_alerts(limit)).await?;
                Ok(serde_json::to_value(alerts)?)
            }
            ControlCommand::Aggregates { student_id } => {
                let aggregates = self.query(move |db| db.minute_aggregates(&student_id)).await?;
                Ok(serde_json::to_value(aggregates)?)
            }
            ControlCommand::Events { device_id, limit } => {
                let (total, events) = self
                    .query(move |db| Ok((db.count_events()?, db.recent_events(&device_id, limit)?)))
                    .await?;
                Ok(json!({ "total_events": total, "events": events }))
            }
        }
    }

    async fn query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EventDatabase) -> classpulse_metrics::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }
}

/// Unix socket control server
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    context: Arc<ControlContext>,
}

impl ControlServer {
    /// Bind the control socket (0600), replacing a stale socket file
    pub fn bind(socket_path: impl AsRef<Path>, context: Arc<ControlContext>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;
        classpulse_paths::secure_socket_permissions(&socket_path)?;

        info!("Control server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
            context,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, context).await {
                    error!("Control connection error: {}", e);
                }
            });
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Serve one control connection until the client hangs up
pub async fn handle_connection(stream: UnixStream, context: Arc<ControlContext>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Received control command: {}", line.trim());

        let response = match ControlCommand::parse(&line) {
            Ok(command) => match context.execute(command).await {
                Ok(result) => json!({ "ok": true, "result": result }),
                Err(e) => json!({ "ok": false, "error": format!("{:#}", e) }),
            },
            Err(e) => json!({ "ok": false, "error": format!("{:#}", e) }),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
