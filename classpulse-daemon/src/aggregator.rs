//! Periodic minute aggregates and risk alerts

use anyhow::{Context, Result};
use chrono::Utc;
use classpulse_metrics::EventDatabase;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AggregatorConfig;

/// Result of one aggregation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregationReport {
    pub buckets_written: usize,
    pub alerts_created: usize,
}

/// Compute minute aggregates for the recent window, then raise risk alerts
pub async fn run_once(db: Arc<EventDatabase>, minutes_back: i64) -> Result<AggregationReport> {
    tokio::task::spawn_blocking(move || -> Result<AggregationReport> {
        let now = Utc::now();
        let buckets_written = db
            .compute_minute_aggregates(now, minutes_back)
            .context("Failed to compute minute aggregates")?;

        let alerts = db
            .check_and_create_alerts(now)
            .context("Failed to check risk alerts")?;
        for alert in &alerts {
            warn!(
                student_id = %alert.student_id,
                device_id = %alert.source_device,
                severity = alert.severity.as_str(),
                "{}",
                alert.message
            );
        }

        Ok(AggregationReport {
            buckets_written,
            alerts_created: alerts.len(),
        })
    })
    .await
    .context("Aggregation task failed")?
}

/// Run [`run_once`] every `interval_secs` until the task is aborted
pub fn spawn(db: Arc<EventDatabase>, config: &AggregatorConfig) -> JoinHandle<()> {
    let period = Duration::from_secs(config.interval_secs.max(1));
    let minutes_back = config.minutes_back;

    tokio::spawn(async move {
        info!("Aggregator running every {:?}", period);
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately; skip it so startup is not a pass
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match run_once(Arc::clone(&db), minutes_back).await {
                Ok(report) => info!(
                    buckets = report.buckets_written,
                    alerts = report.alerts_created,
                    "Aggregation pass complete"
                ),
                Err(e) => error!("Aggregation failed: {:#}", e),
            }
        }
    })
}
