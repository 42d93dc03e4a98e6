//! Engine output flowing into storage, the way the daemon uses it

use chrono::Utc;
use classpulse_metrics::{EngineConfig, EventDatabase, MetricsEngine, RawFrameEvent, Sample};
use serde_json::json;
use tempfile::TempDir;

fn frame(student: &str, emotion: &str, p: f64) -> RawFrameEvent {
    let rest = (1.0 - p) / 6.0;
    let labels = ["Angry", "Disgust", "Fear", "Happy", "Sad", "Surprise", "Neutral"];
    let probabilities: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|l| {
            let v = if *l == emotion { p } else { rest };
            (l.to_string(), json!(v))
        })
        .collect();

    RawFrameEvent::from_value(json!({
        "student_id": student,
        "emotion": emotion,
        "emotion_confidence": p,
        "probabilities": probabilities,
        "box": {"x": 100.0, "y": 100.0, "w": 80.0, "h": 80.0},
        "ear": 0.3,
        "source_device": "room-101"
    }))
    .unwrap()
}

#[test]
fn test_scored_events_are_persisted_and_aggregated() {
    let tmp_dir = TempDir::new().unwrap();
    let db = EventDatabase::new(tmp_dir.path().join("events.db")).unwrap();
    let mut engine = MetricsEngine::new(EngineConfig::default());

    let now = Utc::now();
    for _ in 0..20 {
        let mut event = frame("s1", "Happy", 0.8);
        engine.push(Sample::from_event(&event));
        event.metrics = engine.compute();
        assert!(event.metrics.is_some());
        db.insert_event(now, &event).unwrap();
    }

    assert_eq!(db.count_events().unwrap(), 20);

    let stored = db.recent_events("room-101", 1).unwrap();
    let metrics = stored[0].metrics.expect("metrics stored with event");
    for (name, value) in metrics.fields() {
        assert!((0.0..=1.0).contains(&value), "{} out of range: {}", name, value);
    }
    assert!(metrics.positivity > 0.5);

    db.compute_minute_aggregates(now + chrono::Duration::seconds(1), 5)
        .unwrap();
    let aggregates = db.minute_aggregates("s1").unwrap();
    assert_eq!(aggregates.iter().map(|a| a.sample_count).sum::<i64>(), 20);

    // Happy students do not trip the risk alert
    assert!(db.check_and_create_alerts(now).unwrap().is_empty());
}
