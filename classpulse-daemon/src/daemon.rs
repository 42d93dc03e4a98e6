//! Daemon lifecycle: wire the services together, serve, shut down in order

use anyhow::{Context, Result};
use classpulse_broadcaster::{LiveBroadcaster, LiveServer};
use classpulse_metrics::EventDatabase;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator;
use crate::capture::CaptureService;
use crate::config::DaemonConfig;
use crate::ingest::{EventRouter, FallbackLog, SqliteStorage};
use crate::ipc::{ControlContext, ControlServer};
use crate::pipeline::IngestPipeline;
use crate::supervisor::WorkerSupervisor;

/// Every long-lived service of a running daemon
pub struct Daemon {
    db: Arc<EventDatabase>,
    broadcaster: Arc<LiveBroadcaster>,
    supervisor: Arc<WorkerSupervisor>,
    capture: Arc<CaptureService>,
    live_server: LiveServer,
    control: ControlServer,
    aggregator_task: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Open storage, build the relay and pipeline, and bind both sockets
    pub async fn start(config: &DaemonConfig) -> Result<Self> {
        let db_path = config.database_path()?;
        let db = Arc::new(
            EventDatabase::new(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?,
        );
        info!("Event database: {}", db_path.display());

        let relay = config.relay.build()?;
        match &config.relay.url {
            Some(url) => info!("Live rooms relayed through {}", url),
            None => info!("Live rooms are local to this process"),
        }

        let broadcaster = Arc::new(LiveBroadcaster::new(relay));
        let router = Arc::new(EventRouter::new(
            Arc::new(SqliteStorage::new(Arc::clone(&db))),
            FallbackLog::new(config.fallback_log_path()?),
            Arc::clone(&broadcaster),
        ));
        let pipeline = Arc::new(
            IngestPipeline::new(Arc::clone(&router), config.engine)
                .with_session_ledger(Arc::clone(&db)),
        );
        let supervisor = Arc::new(WorkerSupervisor::new(config.capture.clone(), pipeline));
        let capture = Arc::new(CaptureService::new(Arc::clone(&db), Arc::clone(&supervisor)));

        let live_server = LiveServer::new(config.live_socket_path()?, Arc::clone(&broadcaster));
        live_server
            .start()
            .await
            .context("Failed to start live server")?;

        let control = ControlServer::bind(
            config.control_socket_path()?,
            Arc::new(ControlContext {
                capture: Arc::clone(&capture),
                router,
                db: Arc::clone(&db),
            }),
        )
        .context("Failed to start control server")?;

        let aggregator_task = config
            .aggregator
            .enabled
            .then(|| aggregator::spawn(Arc::clone(&db), &config.aggregator));

        Ok(Self {
            db,
            broadcaster,
            supervisor,
            capture,
            live_server,
            control,
            aggregator_task,
        })
    }

    pub fn database(&self) -> &Arc<EventDatabase> {
        &self.db
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    pub fn capture(&self) -> &Arc<CaptureService> {
        &self.capture
    }

    pub fn control_socket_path(&self) -> &Path {
        self.control.socket_path()
    }

    pub fn live_socket_path(&self) -> &Path {
        self.live_server.socket_path()
    }

    /// Serve the control socket until `shutdown` resolves or the server
    /// fails, then shut down
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::select! {
            result = self.control.run() => {
                if let Err(e) = result {
                    error!("Control server error: {:#}", e);
                }
            }
            _ = shutdown => {
                info!("Received shutdown signal");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every worker, the aggregator, the live server and the relay
    /// forwarders, then remove the control socket. Running sessions are
    /// closed as stopped.
    pub async fn shutdown(self) {
        info!("Shutting down...");
        for (device_id, status) in self.capture.all_status().await {
            if !status.is_running {
                continue;
            }
            if let Err(e) = self.capture.stop_device(&device_id).await {
                warn!(device_id = %device_id, "Failed to close capture session: {}", e);
            }
        }
        // Anything started after the sweep above
        self.supervisor.stop_all_workers().await;

        if let Some(task) = self.aggregator_task {
            task.abort();
        }
        if let Err(e) = self.live_server.stop().await {
            warn!("Failed to stop live server: {}", e);
        }
        self.broadcaster.shutdown().await;
        drop(self.control);

        info!("ClassPulse daemon stopped");
    }
}
