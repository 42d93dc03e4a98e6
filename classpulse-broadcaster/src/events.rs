use chrono::{DateTime, Utc};
use classpulse_metrics::RawFrameEvent;
use serde::{Deserialize, Serialize};

/// Messages delivered to dashboard subscribers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum LiveEvent {
    /// One scored telemetry record
    #[serde(rename = "frame")]
    Frame {
        device_id: String,
        event: RawFrameEvent,
    },

    /// A device's capture stream ended
    #[serde(rename = "capture_ended")]
    CaptureEnded {
        device_id: String,
        session_id: Option<i64>,
        events_count: u64,
        error_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// Acknowledges `subscribe <room>` on the live socket
    #[serde(rename = "subscribed")]
    Subscribed { room: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl LiveEvent {
    /// Room the event is published to, if it belongs to one
    pub fn room(&self) -> Option<&str> {
        match self {
            LiveEvent::Frame { device_id, .. } | LiveEvent::CaptureEnded { device_id, .. } => {
                Some(device_id)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert event to JSON string with newline
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}
