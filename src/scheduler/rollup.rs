//! Rollup manager for aggregating raw probe results into hourly windows.

use crate::db::{latency_digest, serialize_tdigest, ProbeResult, ProbeRollup, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Width of a rollup window.
pub const ROLLUP_WINDOW_SECONDS: i64 = 3600;

/// Slack after a window closes before it is rolled up, so late batch
/// flushes land in the raw table first.
const SETTLE_SECONDS: i64 = 30;

/// Manager for rolling up raw data into hourly windows.
pub struct RollupManager {
    store: Arc<Store>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Start the rollup manager background task.
    pub fn start(&self) {
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                interval.tick().await;
                process_rollups(&store, Utc::now());
            }
        });
    }
}

fn process_rollups(store: &Store, now: DateTime<Utc>) {
    let targets = match store.get_targets() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("RollupManager: Failed to get targets: {}", e);
            return;
        }
    };

    for target in targets {
        process_device_window(store, target.device_id, ROLLUP_WINDOW_SECONDS, now);
    }
}

/// Roll up every complete window for one device since the last rollup.
pub fn process_device_window(store: &Store, device_id: Uuid, window_seconds: i64, now: DateTime<Utc>) {
    let mut next_window_start = match store.get_last_rollup_time(device_id, window_seconds) {
        // The stored time is the start of the last rolled-up window.
        Ok(Some(last_time)) => last_time + ChronoDuration::seconds(window_seconds),
        Ok(None) => match store.get_earliest_probe_time(device_id) {
            Ok(Some(earliest)) => truncate_to_window(earliest, window_seconds),
            Ok(None) => return,
            Err(e) => {
                tracing::error!("RollupManager: Error getting earliest time: {}", e);
                return;
            }
        },
        Err(e) => {
            tracing::error!("RollupManager: Failed to get last rollup time: {}", e);
            return;
        }
    };

    let cutoff = now - ChronoDuration::seconds(SETTLE_SECONDS);
    let mut rollups = Vec::new();

    loop {
        let window_end = next_window_start + ChronoDuration::seconds(window_seconds);
        if window_end > cutoff {
            break;
        }

        let raws = match store.get_probe_results(device_id, next_window_start, window_end, i64::MAX) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("RollupManager: Error fetching probe results: {}", e);
                break;
            }
        };
        rollups.push(aggregate_window(device_id, window_seconds, next_window_start, &raws));

        next_window_start = window_end;
    }

    if rollups.is_empty() {
        return;
    }

    let count = rollups.len();
    match store.add_rollups(&rollups) {
        Ok(()) => tracing::debug!("RollupManager: Saved {} rollups for {} (w={}s)", count, device_id, window_seconds),
        Err(e) => tracing::error!(
            "RollupManager: Failed to save batch for {} (w={}s): {}",
            device_id,
            window_seconds,
            e
        ),
    }
}

/// Aggregate one window of raw results. Empty windows still produce a row so
/// the manager does not revisit them.
pub fn aggregate_window(
    device_id: Uuid,
    window_seconds: i64,
    start: DateTime<Utc>,
    raws: &[ProbeResult],
) -> ProbeRollup {
    let latencies: Vec<f64> = raws.iter().filter(|r| r.success).filter_map(|r| r.response_time_ms).collect();

    let min = latencies.iter().copied().reduce(f64::min);
    let max = latencies.iter().copied().reduce(f64::max);
    let sum: f64 = latencies.iter().sum();

    ProbeRollup {
        time: start,
        device_id,
        window_seconds,
        total: raws.len() as i64,
        successful: raws.iter().filter(|r| r.success).count() as i64,
        response_time_sum: sum,
        min_response_time: min,
        max_response_time: max,
        tdigest_data: latency_digest(latencies).map(|td| serialize_tdigest(&td)).unwrap_or_default(),
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
