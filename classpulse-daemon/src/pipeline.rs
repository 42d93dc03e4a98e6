//! Capture output → metrics engine → event router

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use classpulse_broadcaster::LiveEvent;
use classpulse_metrics::{EngineConfig, EventDatabase, MetricsEngine, RawFrameEvent, Sample, SessionStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ingest::EventRouter;
use crate::worker::{FrameHandler, WorkerContext, WorkerExit};

/// Frame handler that scores each record with its session's engine
///
/// One [`MetricsEngine`] exists per capture session. It is created with the
/// session's first frame and dropped when the session's worker exits.
pub struct IngestPipeline {
    router: Arc<EventRouter>,
    engine_config: EngineConfig,
    engines: Mutex<HashMap<i64, MetricsEngine>>,
    sessions: Option<Arc<EventDatabase>>,
}

impl IngestPipeline {
    pub fn new(router: Arc<EventRouter>, engine_config: EngineConfig) -> Self {
        Self {
            router,
            engine_config,
            engines: Mutex::new(HashMap::new()),
            sessions: None,
        }
    }

    /// Record unexpected worker exits in the capture session ledger
    pub fn with_session_ledger(mut self, db: Arc<EventDatabase>) -> Self {
        self.sessions = Some(db);
        self
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub async fn active_engines(&self) -> usize {
        self.engines.lock().await.len()
    }

    /// Push the frame into the session's engine and attach the derived
    /// metrics unless the producer already supplied them
    async fn score(&self, session_id: i64, event: &mut RawFrameEvent) {
        let mut engines = self.engines.lock().await;
        let engine = engines
            .entry(session_id)
            .or_insert_with(|| MetricsEngine::new(self.engine_config));

        engine.push(Sample::from_event(event));
        let derived = engine.compute();
        if event.metrics.is_none() {
            event.metrics = derived;
        }
    }

    async fn record_exit(&self, ctx: &WorkerContext, exit: &WorkerExit) {
        let Some(db) = &self.sessions else {
            return;
        };
        let status = if exit.is_clean() {
            SessionStatus::Stopped
        } else {
            SessionStatus::Failed
        };

        let db = Arc::clone(db);
        let session_id = ctx.session_id;
        let result = tokio::task::spawn_blocking(move || -> classpulse_metrics::Result<_> {
            match db.get_capture_session(session_id)? {
                Some(session) if session.status == SessionStatus::Running => {
                    db.update_session_status(session_id, status).map(Some)
                }
                _ => Ok(None),
            }
        })
        .await;

        match result {
            Ok(Ok(Some(_))) => {
                info!(session_id, status = %status, "Capture session ended with its process")
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(session_id, "Failed to update capture session: {}", e),
            Err(e) => warn!(session_id, "Session update task failed: {}", e),
        }
    }
}

#[async_trait]
impl FrameHandler for IngestPipeline {
    async fn handle_frame(&self, ctx: &WorkerContext, frame: Value) -> Result<()> {
        let mut event = RawFrameEvent::from_value(frame)?;
        self.score(ctx.session_id, &mut event).await;

        // The worker's device is the room, whatever the producer wrote
        let outcome = self.router.ingest_to(&ctx.device_id, event).await;
        if !outcome.persisted {
            debug!(device_id = %ctx.device_id, "Event kept in fallback log");
        }
        Ok(())
    }

    async fn worker_exited(&self, ctx: &WorkerContext, exit: &WorkerExit) {
        self.engines.lock().await.remove(&ctx.session_id);

        if !exit.requested {
            self.record_exit(ctx, exit).await;
        }

        let notice = LiveEvent::CaptureEnded {
            device_id: ctx.device_id.clone(),
            session_id: Some(ctx.session_id),
            events_count: exit.events_count,
            error_count: exit.error_count,
            timestamp: Utc::now(),
        };
        if !self.router.publish(notice) {
            warn!(device_id = %ctx.device_id, "capture_ended notice dropped");
        }
    }
}
