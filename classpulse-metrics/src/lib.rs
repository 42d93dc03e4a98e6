//! ClassPulse metrics
//!
//! Affect telemetry models, the streaming metrics engine and SQLite
//! persistence for events, capture sessions, minute aggregates and alerts.

pub mod database;
pub mod engine;
pub mod error;
pub mod models;

// Re-export main types
pub use database::{
    EventDatabase, ALERT_WINDOW_MINUTES, RISK_ALERT_THRESHOLD, RISK_CRITICAL_THRESHOLD,
};
pub use engine::{EngineConfig, MetricsEngine, Sample};
pub use error::{MetricsError, Result};
pub use models::{
    parse_timestamp, AlertSeverity, CaptureSession, DerivedMetrics, Emotion, FaceBox, HeadPose,
    MinuteAggregate, ProbabilityVector, RawFrameEvent, RawPayload, RiskAlert, SessionStatus,
    DEFAULT_SOURCE_DEVICE, NUM_CLASSES,
};
