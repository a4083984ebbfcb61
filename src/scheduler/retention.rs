//! Retention manager for cleaning up old data.

use crate::config::MonitorConfig;
use crate::db::Store;

use super::rollup::ROLLUP_WINDOW_SECONDS;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

/// How long each kind of data is kept.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub raw_days: i64,
    pub rollup_days: i64,
    pub alert_days: i64,
}

impl From<&MonitorConfig> for RetentionPolicy {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            raw_days: cfg.raw_retention_days,
            rollup_days: cfg.rollup_retention_days,
            alert_days: cfg.alert_retention_days,
        }
    }
}

/// Rows removed by one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub raw_results: usize,
    pub rollups: usize,
    pub alerts: usize,
}

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let policy = self.policy;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                interval.tick().await;
                process_retention(&store, policy, Utc::now());
            }
        });
    }
}

/// Delete everything older than its retention period.
pub fn process_retention(store: &Store, policy: RetentionPolicy, now: DateTime<Utc>) -> RetentionReport {
    let mut report = RetentionReport::default();

    match store.delete_probe_results_before(now - ChronoDuration::days(policy.raw_days)) {
        Ok(n) => report.raw_results = n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete raw results: {}", e),
    }

    match store.delete_rollups_before(ROLLUP_WINDOW_SECONDS, now - ChronoDuration::days(policy.rollup_days)) {
        Ok(n) => report.rollups = n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete rollups: {}", e),
    }

    match store.delete_alerts_before(now - ChronoDuration::days(policy.alert_days)) {
        Ok(n) => report.alerts = n,
        Err(e) => tracing::error!("RetentionManager: Failed to delete alerts: {}", e),
    }

    if report != RetentionReport::default() {
        tracing::info!(
            "RetentionManager: Removed {} raw results, {} rollups, {} alerts",
            report.raw_results,
            report.rollups,
            report.alerts
        );
    }

    report
}
