//! One supervised capture subprocess
//!
//! The child writes one JSON object per line to stdout. Two dedicated
//! threads drain stdout and stderr; decoded records cross into the tokio
//! runtime through an unbounded channel, so a slow handler never stalls the
//! reader. A per-worker dispatcher task feeds records to the
//! [`FrameHandler`] in the order they were read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, BufReader};
use std::panic::AssertUnwindSafe;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CaptureSettings;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Which worker a frame came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub device_id: String,
    pub session_id: i64,
}

/// Outcome reported once a worker's output stream has ended
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    pub events_count: u64,
    pub error_count: u64,
    /// `None` when the process was killed by a signal or never reaped
    pub exit_code: Option<i32>,
    /// True when the exit followed a stop request
    pub requested: bool,
}

impl WorkerExit {
    pub fn is_clean(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Consumer of decoded capture records
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handle one record. An error is counted against the worker and logged.
    async fn handle_frame(&self, ctx: &WorkerContext, frame: Value) -> anyhow::Result<()>;

    /// Called once after the process exited and its readers finished
    async fn worker_exited(&self, _ctx: &WorkerContext, _exit: &WorkerExit) {}
}

/// Per-start overrides of the capture defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRequest {
    /// Camera index or stream URL
    pub video_src: Option<Value>,
    pub model_path: Option<String>,
    pub match_thresh: Option<f64>,
    pub log_every: Option<u32>,
}

impl CaptureRequest {
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            other => serde_json::from_value(other.clone()),
        }
    }
}

/// Capture flags appended after the configured program arguments
pub fn capture_args(settings: &CaptureSettings, device_id: &str, request: &CaptureRequest) -> Vec<String> {
    let video_src = match &request.video_src {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => settings.video_src.clone(),
        Some(other) => other.to_string(),
    };
    let model_path = request
        .model_path
        .clone()
        .unwrap_or_else(|| settings.model_path.clone());
    let match_thresh = request.match_thresh.unwrap_or(settings.match_thresh);
    let log_every = request.log_every.unwrap_or(settings.log_every);

    vec![
        "--video-src".to_string(),
        video_src,
        "--model-path".to_string(),
        model_path,
        "--device-id".to_string(),
        device_id.to_string(),
        "--match-thresh".to_string(),
        match_thresh.to_string(),
        "--log-every".to_string(),
        log_every.to_string(),
        "--output-mode".to_string(),
        "json".to_string(),
    ]
}

fn build_command(settings: &CaptureSettings, device_id: &str, request: &CaptureRequest) -> Command {
    let mut command = Command::new(&settings.program);
    command
        .args(&settings.args)
        .args(capture_args(settings, device_id, request))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &settings.working_dir {
        command.current_dir(dir);
    }

    // Own process group so signals reach anything the capture program forks
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command
}

/// Consistent snapshot of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub device_id: String,
    pub session_id: i64,
    pub is_running: bool,
    pub events_count: u64,
    pub error_count: u64,
    pub started_at: DateTime<Utc>,
    /// Seconds since start, frozen once the process has exited
    pub uptime: f64,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

struct WorkerState {
    is_running: bool,
    stopping: bool,
    events_count: u64,
    error_count: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    ended: Option<Instant>,
    exit_code: Option<i32>,
}

enum WorkerMessage {
    Frame(Value),
    Ended,
}

struct WorkerShared {
    device_id: String,
    session_id: i64,
    pid: u32,
    state: Mutex<WorkerState>,
    child: Mutex<Child>,
    readers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerShared {
    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child.lock().try_wait()
    }

    /// Poll for process exit until `timeout` elapses
    async fn wait_for_exit(&self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.try_wait()?;
            if status.is_some() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        let pgid = self.pid as libc::pid_t;
        // SAFETY: plain syscall on a process group id we created
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn terminate(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.child.lock().kill()
        }
    }

    fn force_kill(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGKILL)?;
        }
        match self.child.lock().kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }

    /// Terminate, wait, then kill. Returns the exit status once observed.
    async fn shut_down(&self, grace: Duration) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.try_wait()? {
            return Ok(Some(status));
        }

        self.terminate()?;
        if let Some(status) = self.wait_for_exit(grace).await? {
            return Ok(Some(status));
        }

        warn!(device_id = %self.device_id, "Force killing capture process");
        self.force_kill()?;
        self.wait_for_exit(grace.max(Duration::from_secs(1))).await
    }

    /// Join reader threads, giving up after `timeout`
    async fn join_readers(&self, timeout: Duration) {
        let readers: Vec<_> = std::mem::take(&mut *self.readers.lock());
        let deadline = Instant::now() + timeout;

        for reader in readers {
            while !reader.is_finished() {
                if Instant::now() >= deadline {
                    warn!(device_id = %self.device_id, "Reader thread did not finish in {:?}", timeout);
                    return;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            if reader.join().is_err() {
                error!(device_id = %self.device_id, "Reader thread panicked");
            }
        }
    }

    /// Record the exit and return the summary
    fn mark_exited(&self, status: Option<ExitStatus>) -> WorkerExit {
        let mut state = self.state.lock();
        state.is_running = false;
        state.ended.get_or_insert_with(Instant::now);
        if let Some(code) = status.and_then(|s| s.code()) {
            state.exit_code = Some(code);
        }
        WorkerExit {
            events_count: state.events_count,
            error_count: state.error_count,
            exit_code: state.exit_code,
            requested: state.stopping,
        }
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            device_id: self.device_id.clone(),
            session_id: self.session_id,
        }
    }
}

/// Runtime handle for one device's capture process
pub struct CaptureWorker {
    shared: Arc<WorkerShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
    join_timeout: Duration,
}

impl CaptureWorker {
    /// Launch the capture process and its readers.
    ///
    /// Returns once the process is spawned. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        device_id: &str,
        session_id: i64,
        settings: &CaptureSettings,
        request: &CaptureRequest,
        handler: Arc<dyn FrameHandler>,
    ) -> io::Result<Self> {
        let mut child = build_command(settings, device_id, request).spawn()?;
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(io::ErrorKind::Other, "capture output not piped"));
            }
        };

        let shared = Arc::new(WorkerShared {
            device_id: device_id.to_string(),
            session_id,
            pid,
            state: Mutex::new(WorkerState {
                is_running: true,
                stopping: false,
                events_count: 0,
                error_count: 0,
                started_at: Utc::now(),
                started: Instant::now(),
                ended: None,
                exit_code: None,
            }),
            child: Mutex::new(child),
            readers: Mutex::new(Vec::with_capacity(2)),
        });

        let (tx, rx) = mpsc::unbounded_channel();

        if let Err(e) = Self::start_readers(&shared, stdout, stderr, tx) {
            let _ = shared.force_kill();
            let _ = shared.child.lock().wait();
            return Err(e);
        }

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&shared),
            rx,
            handler,
            settings.stop_timeout(),
            settings.join_timeout(),
        ));

        info!(
            device_id = %device_id,
            session_id,
            pid,
            "Capture started"
        );

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
            stop_timeout: settings.stop_timeout(),
            join_timeout: settings.join_timeout(),
        })
    }

    fn start_readers(
        shared: &Arc<WorkerShared>,
        stdout: ChildStdout,
        stderr: ChildStderr,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> io::Result<()> {
        let out_shared = Arc::clone(shared);
        let stdout_reader = thread::Builder::new()
            .name(format!("{}-stdout", shared.device_id))
            .spawn(move || read_stdout(out_shared, stdout, tx))?;
        shared.readers.lock().push(stdout_reader);

        let device_id = shared.device_id.clone();
        let stderr_reader = thread::Builder::new()
            .name(format!("{}-stderr", shared.device_id))
            .spawn(move || read_stderr(device_id, stderr))?;
        shared.readers.lock().push(stderr_reader);

        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn session_id(&self) -> i64 {
        self.shared.session_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_running
    }

    pub fn status(&self) -> WorkerStatus {
        let state = self.shared.state.lock();
        let until = state.ended.unwrap_or_else(Instant::now);
        WorkerStatus {
            device_id: self.shared.device_id.clone(),
            session_id: self.shared.session_id,
            is_running: state.is_running,
            events_count: state.events_count,
            error_count: state.error_count,
            started_at: state.started_at,
            uptime: until.duration_since(state.started).as_secs_f64(),
            pid: Some(self.shared.pid),
            exit_code: state.exit_code,
        }
    }

    /// Claim the right to stop this worker. False when it already exited or
    /// another stop is in progress.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.is_running || state.stopping {
            return false;
        }
        state.stopping = true;
        true
    }

    /// Stop the process: SIGTERM, bounded wait, SIGKILL. Returns true once
    /// the exit has been observed and the readers joined. Call after a
    /// successful [`CaptureWorker::begin_stop`].
    pub async fn stop(&self) -> bool {
        let device_id = &self.shared.device_id;
        info!(device_id = %device_id, "Stopping capture");

        let status = match self.shared.shut_down(self.stop_timeout).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                error!(device_id = %device_id, "Capture process did not exit after SIGKILL");
                self.shared.state.lock().stopping = false;
                return false;
            }
            Err(e) => {
                error!(device_id = %device_id, "Error stopping capture: {}", e);
                self.shared.state.lock().stopping = false;
                return false;
            }
        };

        self.shared.join_readers(self.join_timeout).await;
        self.shared.mark_exited(Some(status));

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if tokio::time::timeout(self.join_timeout, dispatcher).await.is_err() {
                warn!(device_id = %device_id, "Dispatcher still draining after stop");
            }
        }

        info!(device_id = %device_id, "Capture stopped");
        true
    }
}

fn read_stdout(shared: Arc<WorkerShared>, stdout: ChildStdout, tx: mpsc::UnboundedSender<WorkerMessage>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(device_id = %shared.device_id, "Capture stdout read failed: {}", e);
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(mut record)) => {
                if !matches!(record.get("source_device"), Some(Value::String(_))) {
                    record.insert(
                        "source_device".to_string(),
                        Value::String(shared.device_id.clone()),
                    );
                }
                shared.state.lock().events_count += 1;
                // Dispatcher only disappears on runtime shutdown; keep draining
                let _ = tx.send(WorkerMessage::Frame(Value::Object(record)));
            }
            _ => debug!(device_id = %shared.device_id, "{}", line),
        }
    }

    let _ = tx.send(WorkerMessage::Ended);
    info!(device_id = %shared.device_id, "Capture stdout ended");
}

fn read_stderr(device_id: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if !line.is_empty() {
                    warn!(device_id = %device_id, "[stderr] {}", line);
                }
            }
        }
    }
}

async fn dispatch(
    shared: Arc<WorkerShared>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    handler: Arc<dyn FrameHandler>,
    stop_timeout: Duration,
    join_timeout: Duration,
) {
    let ctx = shared.context();

    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Frame(frame) => {
                let outcome = AssertUnwindSafe(handler.handle_frame(&ctx, frame))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        shared.state.lock().error_count += 1;
                        error!(device_id = %ctx.device_id, "Event callback error: {:#}", e);
                    }
                    Err(_) => {
                        shared.state.lock().error_count += 1;
                        error!(device_id = %ctx.device_id, "Event callback panicked");
                    }
                }
            }
            WorkerMessage::Ended => break,
        }
    }

    // stdout closed: the process is gone or about to be
    let status = match shared.shut_down(stop_timeout).await {
        Ok(status) => status,
        Err(e) => {
            warn!(device_id = %ctx.device_id, "Failed to reap capture process: {}", e);
            None
        }
    };
    shared.join_readers(join_timeout).await;
    let exit = shared.mark_exited(status);

    info!(
        device_id = %ctx.device_id,
        session_id = ctx.session_id,
        events = exit.events_count,
        errors = exit.error_count,
        exit_code = ?exit.exit_code,
        "Capture process exited"
    );

    if AssertUnwindSafe(handler.worker_exited(&ctx, &exit))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(device_id = %ctx.device_id, "Exit callback panicked");
    }
}
