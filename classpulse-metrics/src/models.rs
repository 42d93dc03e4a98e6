//! Data models for telemetry records, derived metrics and capture sessions

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{MetricsError, Result};

/// Number of classes produced by the emotion classifier.
pub const NUM_CLASSES: usize = 7;

/// Source device used when a record does not name one.
pub const DEFAULT_SOURCE_DEVICE: &str = "default";

/// Fixed emotion label set, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Surprise,
    Fear,
    Disgust,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; NUM_CLASSES] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
        Emotion::Neutral,
    ];

    /// Position of this label in a probability vector.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Angry => "Angry",
            Emotion::Surprise => "Surprise",
            Emotion::Fear => "Fear",
            Emotion::Disgust => "Disgust",
            Emotion::Neutral => "Neutral",
        }
    }

    /// Case-insensitive label lookup.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(label))
    }

    /// Labels that count towards boredom and long-window risk.
    pub fn is_low_arousal(self) -> bool {
        matches!(self, Emotion::Neutral | Emotion::Sad)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class-probability vector over [`Emotion::ALL`].
///
/// Always non-negative and summing to 1: non-finite or negative entries are
/// zeroed and the remainder renormalized; an all-zero input becomes uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityVector([f64; NUM_CLASSES]);

impl ProbabilityVector {
    pub fn new(values: [f64; NUM_CLASSES]) -> Self {
        let mut values = values.map(|v| if v.is_finite() && v > 0.0 { v } else { 0.0 });
        let sum: f64 = values.iter().sum();
        if sum <= f64::EPSILON {
            values = [1.0 / NUM_CLASSES as f64; NUM_CLASSES];
        } else {
            for v in values.iter_mut() {
                *v /= sum;
            }
        }
        Self(values)
    }

    /// Build from a label→probability mapping. Unknown labels are ignored.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Self {
        let mut values = [0.0; NUM_CLASSES];
        for (label, p) in map {
            if let Some(emotion) = Emotion::from_label(label) {
                values[emotion.index()] = *p;
            }
        }
        Self::new(values)
    }

    pub fn get(&self, emotion: Emotion) -> f64 {
        self.0[emotion.index()]
    }

    pub fn as_array(&self) -> &[f64; NUM_CLASSES] {
        &self.0
    }

    pub fn argmax(&self) -> Emotion {
        let mut best = Emotion::Happy;
        for emotion in Emotion::ALL {
            if self.get(emotion) > self.get(best) {
                best = emotion;
            }
        }
        best
    }

    /// Combined probability of the negative high-arousal classes.
    pub fn frustration_base(&self) -> f64 {
        self.get(Emotion::Angry) + self.get(Emotion::Fear) + self.get(Emotion::Disgust)
    }
}

impl Default for ProbabilityVector {
    fn default() -> Self {
        Self::new([0.0; NUM_CLASSES])
    }
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// Face bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl FaceBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Half of (width + height), floored at one pixel.
    pub fn scale(&self) -> f64 {
        ((self.w + self.h) / 2.0).max(1.0)
    }
}

/// Opaque passthrough of the producer's original payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPayload(pub serde_json::Value);

/// Composite affect scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub attentiveness: f64,
    pub positivity: f64,
    pub engagement: f64,
    pub boredom: f64,
    pub frustration: f64,
    pub volatility: f64,
    pub distraction: f64,
    pub fatigue: f64,
    pub risk: f64,
}

impl DerivedMetrics {
    /// Named view over every score, in declaration order.
    pub fn fields(&self) -> [(&'static str, f64); 9] {
        [
            ("attentiveness", self.attentiveness),
            ("positivity", self.positivity),
            ("engagement", self.engagement),
            ("boredom", self.boredom),
            ("frustration", self.frustration),
            ("volatility", self.volatility),
            ("distraction", self.distraction),
            ("fatigue", self.fatigue),
            ("risk", self.risk),
        ]
    }
}

/// One telemetry record as emitted by a capture process (one JSON object per line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrameEvent {
    /// Producer timestamp, parsed leniently at ingestion
    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub student_id: Option<String>,

    #[serde(rename = "face_match_confidence", default)]
    pub match_confidence: Option<f64>,

    #[serde(rename = "emotion")]
    pub emotion_label: String,

    pub emotion_confidence: f64,

    pub probabilities: BTreeMap<String, f64>,

    #[serde(rename = "ear", default)]
    pub eye_aspect_ratio: Option<f64>,

    #[serde(default)]
    pub head_pose: Option<HeadPose>,

    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub face_box: Option<FaceBox>,

    /// Scores attached by the metrics engine before persistence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<DerivedMetrics>,

    #[serde(default = "default_source_device")]
    pub source_device: String,

    #[serde(default)]
    pub raw: Option<RawPayload>,
}

fn default_source_device() -> String {
    DEFAULT_SOURCE_DEVICE.to_string()
}

impl RawFrameEvent {
    /// Decode and validate a JSON record.
    ///
    /// Required: `emotion`, `emotion_confidence`, `probabilities`. When the
    /// record carries no `raw` blob, the full original object is kept there.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(MetricsError::invalid_event("expected a JSON object"));
        }

        let mut event: RawFrameEvent = serde_json::from_value(value.clone())
            .map_err(|e| MetricsError::invalid_event(e.to_string()))?;

        if event.raw.is_none() {
            event.raw = Some(RawPayload(value));
        }

        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<()> {
        if self.emotion_label.trim().is_empty() {
            return Err(MetricsError::invalid_event("emotion label is empty"));
        }
        if !self.emotion_confidence.is_finite() {
            return Err(MetricsError::invalid_event("emotion confidence is not finite"));
        }
        if let Some((label, _)) = self.probabilities.iter().find(|(_, p)| !p.is_finite()) {
            return Err(MetricsError::invalid_event(format!(
                "probability for {} is not finite",
                label
            )));
        }
        Ok(())
    }

    /// Parsed producer timestamp, or `received_at` when absent or unparseable.
    pub fn resolved_timestamp(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at)
    }

    pub fn probability_vector(&self) -> ProbabilityVector {
        ProbabilityVector::from_map(&self.probabilities)
    }

    /// Winning label: the reported label when it is one of the known
    /// classes, otherwise the most probable class.
    pub fn top_emotion(&self) -> Emotion {
        Emotion::from_label(&self.emotion_label)
            .unwrap_or_else(|| self.probability_vector().argmax())
    }
}

/// Lenient timestamp parsing: RFC 3339 (with `Z` or an offset), then naive
/// ISO-8601 forms interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Capture session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(MetricsError::InvalidStatus(other.to_string())),
        }
    }
}

/// A request to capture from one device, tracked from start to stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: i64,
    pub device_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
}

/// Per-student averages over one wall-clock minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAggregate {
    pub minute_ts: DateTime<Utc>,
    pub student_id: String,
    pub avg_engagement: f64,
    pub avg_boredom: f64,
    pub avg_frustration: f64,
    pub avg_attentiveness: f64,
    pub avg_positivity: f64,
    pub avg_volatility: f64,
    pub avg_distraction: f64,
    pub avg_fatigue: f64,
    pub avg_risk: f64,
    pub sample_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Raised when a student's recent average risk crosses the alert threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: i64,
    pub student_id: String,
    pub source_device: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
