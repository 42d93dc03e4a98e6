//! SQLite storage for telemetry events, capture sessions, minute aggregates
//! and risk alerts

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MetricsError, Result};
use crate::models::{
    AlertSeverity, CaptureSession, MinuteAggregate, RawFrameEvent, RiskAlert, SessionStatus,
};

/// Average risk above which a student gets an alert.
pub const RISK_ALERT_THRESHOLD: f64 = 0.7;

/// Average risk above which the alert is critical.
pub const RISK_CRITICAL_THRESHOLD: f64 = 0.85;

/// Lookback for alerts, also the per-student alert cooldown.
pub const ALERT_WINDOW_MINUTES: i64 = 10;

/// Thread-safe SQLite database for events and capture sessions
pub struct EventDatabase {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl EventDatabase {
    /// Create or open the database, creating its schema if needed
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = Self::expand_path(db_path)?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;

        let db = Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Expand a leading `~` to the home directory
    fn expand_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| MetricsError::Internal("invalid path encoding".to_string()))?;

        let expanded = match (path_str.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(path_str),
        };

        Ok(expanded)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MetricsError::Internal("database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                student_id TEXT,
                face_conf REAL,
                emotion TEXT NOT NULL,
                emotion_confidence REAL NOT NULL,
                probabilities TEXT NOT NULL,
                metrics TEXT,
                head_pose TEXT,
                ear REAL,
                source_device TEXT NOT NULL,
                raw TEXT
            );

            CREATE TABLE IF NOT EXISTS capture_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at REAL NOT NULL,
                stopped_at REAL,
                config TEXT
            );

            CREATE TABLE IF NOT EXISTS aggregates_minute (
                minute_ts INTEGER NOT NULL,
                student_id TEXT NOT NULL,
                avg_engagement REAL,
                avg_boredom REAL,
                avg_frustration REAL,
                avg_attentiveness REAL,
                avg_positivity REAL,
                avg_volatility REAL,
                avg_distraction REAL,
                avg_fatigue REAL,
                avg_risk REAL,
                sample_count INTEGER NOT NULL,
                PRIMARY KEY (minute_ts, student_id)
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                source_device TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
            CREATE INDEX IF NOT EXISTS idx_events_device ON events(source_device);
            CREATE INDEX IF NOT EXISTS idx_sessions_device ON capture_sessions(device_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_student ON alerts(student_id, created_at);",
        )?;

        Ok(())
    }

    /// Append one event. Returns the new row id.
    pub fn insert_event(&self, ts: DateTime<Utc>, event: &RawFrameEvent) -> Result<i64> {
        let probabilities = serde_json::to_string(&event.probabilities)?;
        let metrics = event.metrics.as_ref().map(serde_json::to_string).transpose()?;
        let head_pose = event.head_pose.as_ref().map(serde_json::to_string).transpose()?;
        let raw = event.raw.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (
                ts, student_id, face_conf, emotion, emotion_confidence,
                probabilities, metrics, head_pose, ear, source_device, raw
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                to_epoch(ts),
                event.student_id,
                event.match_confidence,
                event.emotion_label,
                event.emotion_confidence,
                probabilities,
                metrics,
                head_pose,
                event.eye_aspect_ratio,
                event.source_device,
                raw,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn count_events(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Most recent `limit` events of one device, oldest first.
    pub fn recent_events(&self, source_device: &str, limit: usize) -> Result<Vec<RawFrameEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT id, ts, student_id, face_conf, emotion, emotion_confidence,
                       probabilities, metrics, head_pose, ear, source_device, raw
                FROM events WHERE source_device = ?1
                ORDER BY id DESC LIMIT ?2
            ) ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![source_device, limit as i64], |row| {
            Ok(EventRow::from_row(row))
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row??.into_event()?);
        }
        Ok(events)
    }

    /// Record a new capture session in the `running` state.
    pub fn create_capture_session(
        &self,
        device_id: &str,
        config: &serde_json::Value,
    ) -> Result<CaptureSession> {
        let started_at = Utc::now();
        let config_text = serde_json::to_string(config)?;

        let id = {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO capture_sessions (device_id, status, started_at, config)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    device_id,
                    SessionStatus::Running.as_str(),
                    to_epoch(started_at),
                    config_text
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.get_capture_session(id)?
            .ok_or(MetricsError::SessionNotFound(id))
    }

    /// Move a session to `status`; leaving `running` stamps `stopped_at`.
    pub fn update_session_status(&self, id: i64, status: SessionStatus) -> Result<CaptureSession> {
        let stopped_at = match status {
            SessionStatus::Running => None,
            _ => Some(to_epoch(Utc::now())),
        };

        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE capture_sessions SET status = ?1, stopped_at = ?2 WHERE id = ?3",
                params![status.as_str(), stopped_at, id],
            )?
        };

        if changed == 0 {
            return Err(MetricsError::SessionNotFound(id));
        }

        self.get_capture_session(id)?
            .ok_or(MetricsError::SessionNotFound(id))
    }

    pub fn get_capture_session(&self, id: i64) -> Result<Option<CaptureSession>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, device_id, status, started_at, stopped_at, config
                 FROM capture_sessions WHERE id = ?1",
                params![id],
                |row| Ok(SessionRow::from_row(row)),
            )
            .optional()?;

        row.map(|r| r?.into_session()).transpose()
    }

    /// Most recent sessions first
    pub fn list_capture_sessions(&self, limit: usize) -> Result<Vec<CaptureSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, status, started_at, stopped_at, config
             FROM capture_sessions ORDER BY started_at DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| Ok(SessionRow::from_row(row)))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??.into_session()?);
        }
        Ok(sessions)
    }

    /// Average all nine metrics per (minute, student) over the last
    /// `minutes_back` minutes, replacing existing rows for the same bucket.
    /// Returns the number of buckets written.
    pub fn compute_minute_aggregates(&self, now: DateTime<Utc>, minutes_back: i64) -> Result<usize> {
        let from = Duration::try_minutes(minutes_back)
            .and_then(|window| now.checked_sub_signed(window))
            .map(to_epoch)
            .ok_or_else(|| {
                MetricsError::Internal(format!("aggregate window of {} minutes is out of range", minutes_back))
            })?;
        let to = to_epoch(now);

        let conn = self.conn()?;
        let written = conn.execute(
            "INSERT INTO aggregates_minute (
                minute_ts, student_id, avg_engagement, avg_boredom, avg_frustration,
                avg_attentiveness, avg_positivity, avg_volatility, avg_distraction,
                avg_fatigue, avg_risk, sample_count
            )
            SELECT
                CAST(ts / 60 AS INTEGER) * 60 AS minute_ts,
                student_id,
                AVG(json_extract(metrics, '$.engagement')),
                AVG(json_extract(metrics, '$.boredom')),
                AVG(json_extract(metrics, '$.frustration')),
                AVG(json_extract(metrics, '$.attentiveness')),
                AVG(json_extract(metrics, '$.positivity')),
                AVG(json_extract(metrics, '$.volatility')),
                AVG(json_extract(metrics, '$.distraction')),
                AVG(json_extract(metrics, '$.fatigue')),
                AVG(json_extract(metrics, '$.risk')),
                COUNT(*)
            FROM events
            WHERE ts >= ?1 AND ts < ?2 AND student_id IS NOT NULL AND metrics IS NOT NULL
            GROUP BY minute_ts, student_id
            ON CONFLICT (minute_ts, student_id) DO UPDATE SET
                avg_engagement = excluded.avg_engagement,
                avg_boredom = excluded.avg_boredom,
                avg_frustration = excluded.avg_frustration,
                avg_attentiveness = excluded.avg_attentiveness,
                avg_positivity = excluded.avg_positivity,
                avg_volatility = excluded.avg_volatility,
                avg_distraction = excluded.avg_distraction,
                avg_fatigue = excluded.avg_fatigue,
                avg_risk = excluded.avg_risk,
                sample_count = excluded.sample_count",
            params![from, to],
        )?;

        Ok(written)
    }

    pub fn minute_aggregates(&self, student_id: &str) -> Result<Vec<MinuteAggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT minute_ts, student_id, avg_engagement, avg_boredom, avg_frustration,
                    avg_attentiveness, avg_positivity, avg_volatility, avg_distraction,
                    avg_fatigue, avg_risk, sample_count
             FROM aggregates_minute WHERE student_id = ?1 ORDER BY minute_ts ASC",
        )?;

        let rows = stmt.query_map(params![student_id], |row| {
            let minute_ts: i64 = row.get(0)?;
            Ok(MinuteAggregate {
                minute_ts: DateTime::from_timestamp(minute_ts, 0).unwrap_or_default(),
                student_id: row.get(1)?,
                avg_engagement: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                avg_boredom: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                avg_frustration: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                avg_attentiveness: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                avg_positivity: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                avg_volatility: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                avg_distraction: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
                avg_fatigue: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
                avg_risk: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
                sample_count: row.get(11)?,
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Raise an alert for every student whose average risk over the last
    /// [`ALERT_WINDOW_MINUTES`] exceeds [`RISK_ALERT_THRESHOLD`], unless one
    /// was already raised for them in that window. Returns the new alerts.
    pub fn check_and_create_alerts(&self, now: DateTime<Utc>) -> Result<Vec<RiskAlert>> {
        let since = to_epoch(now - Duration::minutes(ALERT_WINDOW_MINUTES));

        let conn = self.conn()?;
        let at_risk: Vec<(String, String, f64)> = {
            let mut stmt = conn.prepare(
                "SELECT student_id, source_device, AVG(json_extract(metrics, '$.risk')) AS avg_risk
                 FROM events
                 WHERE ts >= ?1 AND student_id IS NOT NULL AND metrics IS NOT NULL
                 GROUP BY student_id, source_device
                 HAVING avg_risk > ?2",
            )?;
            let rows = stmt.query_map(params![since, RISK_ALERT_THRESHOLD], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut created = Vec::new();
        for (student_id, source_device, avg_risk) in at_risk {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM alerts WHERE student_id = ?1 AND created_at >= ?2 LIMIT 1",
                    params![student_id, since],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                continue;
            }

            let severity = if avg_risk > RISK_CRITICAL_THRESHOLD {
                AlertSeverity::Critical
            } else {
                AlertSeverity::High
            };
            let message = format!("High risk score: {:.2}", avg_risk);

            conn.execute(
                "INSERT INTO alerts (student_id, source_device, alert_type, severity, message, created_at)
                 VALUES (?1, ?2, 'high_risk', ?3, ?4, ?5)",
                params![student_id, source_device, severity.as_str(), message, to_epoch(now)],
            )?;

            tracing::info!(student_id = %student_id, severity = severity.as_str(), "Created risk alert");

            created.push(RiskAlert {
                id: conn.last_insert_rowid(),
                student_id,
                source_device,
                severity,
                message,
                created_at: now,
            });
        }

        Ok(created)
    }

    /// Most recent `limit` alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<RiskAlert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, student_id, source_device, severity, message, created_at
             FROM alerts ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let severity: String = row.get(3)?;
            Ok(RiskAlert {
                id: row.get(0)?,
                student_id: row.get(1)?,
                source_device: row.get(2)?,
                severity: if severity == AlertSeverity::Critical.as_str() {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                },
                message: row.get(4)?,
                created_at: from_epoch(row.get(5)?),
            })
        })?;

        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn to_epoch(dt: DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

fn from_epoch(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64).unwrap_or_default()
}

/// Column values of an `events` row, decoded outside the rusqlite closure.
struct EventRow {
    ts: f64,
    student_id: Option<String>,
    face_conf: Option<f64>,
    emotion: String,
    emotion_confidence: f64,
    probabilities: String,
    metrics: Option<String>,
    head_pose: Option<String>,
    ear: Option<f64>,
    source_device: String,
    raw: Option<String>,
}

impl EventRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            ts: row.get("ts")?,
            student_id: row.get("student_id")?,
            face_conf: row.get("face_conf")?,
            emotion: row.get("emotion")?,
            emotion_confidence: row.get("emotion_confidence")?,
            probabilities: row.get("probabilities")?,
            metrics: row.get("metrics")?,
            head_pose: row.get("head_pose")?,
            ear: row.get("ear")?,
            source_device: row.get("source_device")?,
            raw: row.get("raw")?,
        })
    }

    fn into_event(self) -> Result<RawFrameEvent> {
        Ok(RawFrameEvent {
            timestamp: Some(from_epoch(self.ts).to_rfc3339()),
            student_id: self.student_id,
            match_confidence: self.face_conf,
            emotion_label: self.emotion,
            emotion_confidence: self.emotion_confidence,
            probabilities: serde_json::from_str(&self.probabilities)?,
            eye_aspect_ratio: self.ear,
            head_pose: self.head_pose.as_deref().map(serde_json::from_str).transpose()?,
            face_box: None,
            metrics: self.metrics.as_deref().map(serde_json::from_str).transpose()?,
            source_device: self.source_device,
            raw: self.raw.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

struct SessionRow {
    id: i64,
    device_id: String,
    status: String,
    started_at: f64,
    stopped_at: Option<f64>,
    config: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            device_id: row.get("device_id")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            stopped_at: row.get("stopped_at")?,
            config: row.get("config")?,
        })
    }

    fn into_session(self) -> Result<CaptureSession> {
        let config = match self.config.as_deref() {
            Some(text) => serde_json::from_str(text).unwrap_or(serde_json::Value::Null),
            None => serde_json::Value::Null,
        };

        Ok(CaptureSession {
            id: self.id,
            device_id: self.device_id,
            status: self.status.parse()?,
            started_at: from_epoch(self.started_at),
            stopped_at: self.stopped_at.map(from_epoch),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DerivedMetrics;
    use serde_json::json;
    use tempfile::TempDir;

    fn open() -> (TempDir, EventDatabase) {
        let tmp_dir = TempDir::new().unwrap();
        let db = EventDatabase::new(tmp_dir.path().join("events.db")).unwrap();
        (tmp_dir, db)
    }

    fn event(device: &str, student: Option<&str>, risk: f64) -> RawFrameEvent {
        let mut event = RawFrameEvent::from_value(json!({
            "student_id": student,
            "emotion": "Neutral",
            "emotion_confidence": 0.7,
            "probabilities": {"Neutral": 0.7, "Sad": 0.3},
            "head_pose": {"yaw": 0.0, "pitch": 1.0, "roll": 2.0},
            "source_device": device
        }))
        .unwrap();
        event.metrics = Some(DerivedMetrics {
            engagement: 0.4,
            risk,
            ..Default::default()
        });
        event
    }

    #[test]
    fn test_database_creation() {
        let tmp_dir = TempDir::new().unwrap();
        let db_path = tmp_dir.path().join("nested").join("events.db");
        let db = EventDatabase::new(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(db.path(), db_path.as_path());
    }

    #[test]
    fn test_events_append_in_order() {
        let (_tmp, db) = open();
        let now = Utc::now();
        for i in 0..5 {
            let mut e = event("cam-1", Some("s1"), 0.1);
            e.emotion_confidence = i as f64 / 10.0;
            db.insert_event(now, &e).unwrap();
        }
        db.insert_event(now, &event("cam-2", None, 0.1)).unwrap();

        assert_eq!(db.count_events().unwrap(), 6);
        let recent = db.recent_events("cam-1", 3).unwrap();
        let confidences: Vec<f64> = recent.iter().map(|e| e.emotion_confidence).collect();
        assert_eq!(confidences, vec![0.2, 0.3, 0.4]);
        assert_eq!(recent[0].head_pose.unwrap().roll, 2.0);
        assert_eq!(recent[0].metrics.unwrap().engagement, 0.4);
    }

    #[test]
    fn test_capture_session_lifecycle() {
        let (_tmp, db) = open();
        let session = db
            .create_capture_session("cam-1", &json!({"video_src": "0"}))
            .unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.stopped_at.is_none());
        assert_eq!(session.config["video_src"], "0");

        let stopped = db.update_session_status(session.id, SessionStatus::Stopped).unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.stopped_at.is_some());

        assert!(matches!(
            db.update_session_status(9999, SessionStatus::Failed),
            Err(MetricsError::SessionNotFound(9999))
        ));
        assert!(db.get_capture_session(9999).unwrap().is_none());
    }

    #[test]
    fn test_list_sessions_newest_first() {
        let (_tmp, db) = open();
        let a = db.create_capture_session("cam-1", &json!({})).unwrap();
        let b = db.create_capture_session("cam-2", &json!({})).unwrap();
        let listed = db.list_capture_sessions(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn test_minute_aggregates_group_by_student() {
        let (_tmp, db) = open();
        let now = Utc::now();
        db.insert_event(now - Duration::seconds(5), &event("cam-1", Some("s1"), 0.2)).unwrap();
        db.insert_event(now - Duration::seconds(5), &event("cam-1", Some("s1"), 0.4)).unwrap();
        db.insert_event(now - Duration::seconds(5), &event("cam-1", None, 0.9)).unwrap();

        let written = db.compute_minute_aggregates(now, 5).unwrap();
        assert!(written >= 1);

        let rows = db.minute_aggregates("s1").unwrap();
        let total: i64 = rows.iter().map(|r| r.sample_count).sum();
        assert_eq!(total, 2);

        // Recomputing replaces rather than duplicates
        db.compute_minute_aggregates(now, 5).unwrap();
        let again: i64 = db.minute_aggregates("s1").unwrap().iter().map(|r| r.sample_count).sum();
        assert_eq!(again, 2);

        assert!(db.compute_minute_aggregates(now, i64::MAX).is_err());
    }

    #[test]
    fn test_risk_alerts_are_deduplicated() {
        let (_tmp, db) = open();
        let now = Utc::now();
        db.insert_event(now - Duration::minutes(1), &event("cam-1", Some("s1"), 0.9)).unwrap();
        db.insert_event(now - Duration::minutes(1), &event("cam-1", Some("s2"), 0.75)).unwrap();
        db.insert_event(now - Duration::minutes(1), &event("cam-1", Some("s3"), 0.2)).unwrap();

        let alerts = db.check_and_create_alerts(now).unwrap();
        assert_eq!(alerts.len(), 2);
        let s1 = alerts.iter().find(|a| a.student_id == "s1").unwrap();
        assert_eq!(s1.severity, AlertSeverity::Critical);
        let s2 = alerts.iter().find(|a| a.student_id == "s2").unwrap();
        assert_eq!(s2.severity, AlertSeverity::High);

        assert!(db.check_and_create_alerts(now).unwrap().is_empty());

        let stored = db.recent_alerts(10).unwrap();
        assert_eq!(stored.len(), 2);
        let s1 = stored.iter().find(|a| a.student_id == "s1").unwrap();
        assert_eq!(s1.severity, AlertSeverity::Critical);
        assert_eq!(s1.source_device, "cam-1");
        assert_eq!(db.recent_alerts(1).unwrap().len(), 1);
    }
}
