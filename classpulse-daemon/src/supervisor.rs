//! Registry of capture workers, at most one running worker per device

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::CaptureSettings;
use crate::worker::{CaptureRequest, CaptureWorker, FrameHandler, WorkerStatus};

/// Owns every capture worker of this process
///
/// Exited workers stay registered so their final counters remain visible
/// through [`WorkerSupervisor::get_status`] until the device is started
/// again.
pub struct WorkerSupervisor {
    workers: Mutex<HashMap<String, Arc<CaptureWorker>>>,
    settings: CaptureSettings,
    handler: Arc<dyn FrameHandler>,
}

impl WorkerSupervisor {
    pub fn new(settings: CaptureSettings, handler: Arc<dyn FrameHandler>) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            settings,
            handler,
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Launch a capture process for `device_id`.
    ///
    /// Returns false when the device already has a running worker or the
    /// process could not be spawned.
    pub async fn start_worker(&self, device_id: &str, request: &CaptureRequest, session_id: i64) -> bool {
        let mut workers = self.workers.lock().await;

        if workers.get(device_id).is_some_and(|w| w.is_running()) {
            warn!(device_id = %device_id, "Capture already running");
            return false;
        }

        match CaptureWorker::spawn(
            device_id,
            session_id,
            &self.settings,
            request,
            Arc::clone(&self.handler),
        ) {
            Ok(worker) => {
                workers.insert(device_id.to_string(), Arc::new(worker));
                info!(device_id = %device_id, session_id, "Capture worker registered");
                true
            }
            Err(e) => {
                error!(device_id = %device_id, "Failed to launch capture: {}", e);
                false
            }
        }
    }

    /// Stop the device's running worker. False, without side effects, when
    /// nothing is running for the device or a stop is already underway.
    pub async fn stop_worker(&self, device_id: &str) -> bool {
        let worker = {
            let workers = self.workers.lock().await;
            match workers.get(device_id) {
                Some(worker) if worker.begin_stop() => Arc::clone(worker),
                _ => return false,
            }
        };

        // The registry lock is released while waiting for the process; the
        // worker still reports running, so starts for this device are refused.
        let stopped = worker.stop().await;

        if stopped {
            let mut workers = self.workers.lock().await;
            if workers.get(device_id).is_some_and(|w| Arc::ptr_eq(w, &worker)) {
                workers.remove(device_id);
            }
        }
        stopped
    }

    pub async fn get_status(&self, device_id: &str) -> Option<WorkerStatus> {
        self.workers.lock().await.get(device_id).map(|w| w.status())
    }

    pub async fn get_all_status(&self) -> BTreeMap<String, WorkerStatus> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(device_id, worker)| (device_id.clone(), worker.status()))
            .collect()
    }

    /// Stop every running worker, logging failures
    pub async fn stop_all_workers(&self) {
        let device_ids: Vec<String> = self.workers.lock().await.keys().cloned().collect();

        for device_id in device_ids {
            let running = self
                .get_status(&device_id)
                .await
                .is_some_and(|s| s.is_running);
            if running && !self.stop_worker(&device_id).await {
                error!(device_id = %device_id, "Failed to stop capture");
            }
        }

        info!("All capture workers stopped");
    }
}
