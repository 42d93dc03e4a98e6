//! Read-only tools for the JSONL fallback log

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use classpulse_metrics::parse_timestamp;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

/// Last `n` raw lines of the log
pub fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Log file not found: {}", path.display()))?;

    let mut lines = std::collections::VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines() {
        let line = line?;
        if n == 0 {
            continue;
        }
        if lines.len() == n {
            lines.pop_front();
        }
        lines.push_back(line);
    }
    Ok(lines.into())
}

/// Every well-formed JSON record in the log; malformed lines are skipped
/// with a warning. A missing file yields no records.
pub fn load_records(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(_) => warn!("Skipping malformed JSON line {}", index + 1),
        }
    }
    Ok(records)
}

/// One-line rendering of the last `n` records, with probabilities below
pub fn show_last(path: &Path, n: usize) -> Result<Vec<String>> {
    let records = load_records(path)?;
    let start = records.len().saturating_sub(n);

    let mut out = Vec::new();
    for record in &records[start..] {
        let field = |name: &str| match record.get(name) {
            Some(Value::Null) | None => "-".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let engagement = record
            .pointer("/metrics/engagement")
            .and_then(Value::as_f64)
            .map_or_else(|| "-".to_string(), |e| format!("{:.3}", e));

        out.push(format!(
            "{} | id:{} | emo:{} | eng:{}",
            field("timestamp"),
            field("student_id"),
            field("emotion"),
            engagement
        ));

        if let Some(Value::Object(probs)) = record.get("probabilities") {
            let rendered: Vec<String> = probs
                .iter()
                .filter_map(|(label, p)| p.as_f64().map(|p| format!("{}:{:.2}", label, p)))
                .collect();
            if !rendered.is_empty() {
                out.push(format!("  probs: {}", rendered.join(", ")));
            }
        }
    }
    Ok(out)
}

/// Per-student means over a recent window of the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSummary {
    pub student_id: String,
    pub samples: usize,
    pub avg_engagement: f64,
    pub avg_boredom: f64,
    pub avg_risk: f64,
}

impl std::fmt::Display for StudentSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Student {} | samples: {} | avg_eng:{:.3} | avg_bored:{:.3} | avg_risk:{:.3}",
            self.student_id, self.samples, self.avg_engagement, self.avg_boredom, self.avg_risk
        )
    }
}

/// Summarize records stamped within `minutes` before `now`. Records without
/// a parseable timestamp are ignored; records without a student id are
/// grouped under `unknown`.
pub fn summarize(path: &Path, minutes: i64, now: DateTime<Utc>) -> Result<Vec<StudentSummary>> {
    let cutoff = Duration::try_minutes(minutes)
        .and_then(|window| now.checked_sub_signed(window))
        .with_context(|| format!("Summary window of {} minutes is out of range", minutes))?;

    #[derive(Default)]
    struct Sums {
        count: usize,
        engagement: f64,
        boredom: f64,
        risk: f64,
    }

    let mut by_student: BTreeMap<String, Sums> = BTreeMap::new();
    for record in load_records(path)? {
        let Some(ts) = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
        else {
            continue;
        };
        if ts < cutoff {
            continue;
        }

        let student = record
            .get("student_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let metric = |name: &str| {
            record
                .get("metrics")
                .and_then(|m| m.get(name))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };

        let sums = by_student.entry(student).or_default();
        sums.count += 1;
        sums.engagement += metric("engagement");
        sums.boredom += metric("boredom");
        sums.risk += metric("risk");
    }

    Ok(by_student
        .into_iter()
        .map(|(student_id, s)| {
            let n = s.count as f64;
            StudentSummary {
                student_id,
                samples: s.count,
                avg_engagement: s.engagement / n,
                avg_boredom: s.boredom / n,
                avg_risk: s.risk / n,
            }
        })
        .collect())
}
