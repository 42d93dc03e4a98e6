//! ClassPulse daemon library
//!
//! Capture supervision, ingestion and the control socket, exposed for the
//! binary and for integration testing.

pub mod aggregator;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod ingest;
pub mod ipc;
pub mod logview;
pub mod pipeline;
pub mod supervisor;
pub mod worker;

pub use capture::{CaptureError, CaptureService};
pub use config::{CaptureSettings, DaemonConfig, RelayConfig};
pub use daemon::Daemon;
pub use ingest::{BatchOutcome, EventRouter, EventStorage, FallbackLog, IngestOutcome, SqliteStorage};
pub use ipc::{ControlCommand, ControlContext, ControlServer};
pub use pipeline::IngestPipeline;
pub use supervisor::WorkerSupervisor;
pub use worker::{CaptureRequest, CaptureWorker, FrameHandler, WorkerContext, WorkerExit, WorkerStatus};
