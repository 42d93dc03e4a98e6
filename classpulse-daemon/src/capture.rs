//! Capture session lifecycle on top of the worker supervisor

use classpulse_metrics::{CaptureSession, EventDatabase, MetricsError, SessionStatus};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::supervisor::WorkerSupervisor;
use crate::worker::{CaptureRequest, WorkerStatus};

/// Sessions listed when no limit is given
pub const DEFAULT_SESSION_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture already running for device {0}")]
    AlreadyRunning(String),

    #[error("Invalid capture config: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("Failed to start capture for device {device_id} (session {session_id})")]
    StartFailed { device_id: String, session_id: i64 },

    #[error("Capture session {0} not found")]
    SessionNotFound(i64),

    #[error("Session is not running (status: {0})")]
    NotRunning(SessionStatus),

    #[error("Storage error: {0}")]
    Storage(#[from] MetricsError),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Starts and stops capture sessions, keeping the session ledger in step
/// with the supervisor
pub struct CaptureService {
    db: Arc<EventDatabase>,
    supervisor: Arc<WorkerSupervisor>,
}

impl CaptureService {
    pub fn new(db: Arc<EventDatabase>, supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { db, supervisor }
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Record a running session and launch its worker
    pub async fn start_capture(&self, device_id: &str, config: Value) -> Result<CaptureSession> {
        let request = CaptureRequest::from_value(&config)?;

        if self
            .supervisor
            .get_status(device_id)
            .await
            .is_some_and(|s| s.is_running)
        {
            return Err(CaptureError::AlreadyRunning(device_id.to_string()));
        }

        let session = self
            .blocking({
                let device_id = device_id.to_string();
                move |db| db.create_capture_session(&device_id, &config)
            })
            .await?;

        if !self
            .supervisor
            .start_worker(device_id, &request, session.id)
            .await
        {
            let session_id = session.id;
            self.blocking(move |db| db.update_session_status(session_id, SessionStatus::Failed))
                .await?;
            return Err(CaptureError::StartFailed {
                device_id: device_id.to_string(),
                session_id,
            });
        }

        info!(device_id = %device_id, session_id = session.id, "Capture session started");
        Ok(session)
    }

    /// Stop a running session's worker and close the session
    pub async fn stop_capture(&self, session_id: i64) -> Result<CaptureSession> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or(CaptureError::SessionNotFound(session_id))?;

        if session.status != SessionStatus::Running {
            return Err(CaptureError::NotRunning(session.status));
        }

        let stopped = self.supervisor.stop_worker(&session.device_id).await;
        let status = if stopped {
            SessionStatus::Stopped
        } else {
            warn!(session_id, device_id = %session.device_id, "Worker was not running at stop");
            SessionStatus::Failed
        };

        let session = self
            .blocking(move |db| db.update_session_status(session_id, status))
            .await?;

        info!(session_id, status = %status, "Capture session closed");
        Ok(session)
    }

    /// Stop whatever runs on a device, closing its running sessions
    pub async fn stop_device(&self, device_id: &str) -> Result<bool> {
        let session_id = self.supervisor.get_status(device_id).await.map(|s| s.session_id);
        let stopped = self.supervisor.stop_worker(device_id).await;

        if let (true, Some(session_id)) = (stopped, session_id) {
            self.blocking(move |db| match db.get_capture_session(session_id)? {
                Some(s) if s.status == SessionStatus::Running => {
                    db.update_session_status(session_id, SessionStatus::Stopped).map(Some)
                }
                _ => Ok(None),
            })
            .await?;
        }
        Ok(stopped)
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<CaptureSession>> {
        self.blocking(move |db| db.get_capture_session(session_id)).await
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<CaptureSession>> {
        self.blocking(move |db| db.list_capture_sessions(limit)).await
    }

    pub async fn status(&self, device_id: &str) -> Option<WorkerStatus> {
        self.supervisor.get_status(device_id).await
    }

    pub async fn all_status(&self) -> BTreeMap<String, WorkerStatus> {
        self.supervisor.get_all_status().await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EventDatabase) -> classpulse_metrics::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }
}
