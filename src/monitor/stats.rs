//! Window statistics over durable probe results.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tdigests::TDigest;
use uuid::Uuid;

use crate::db::{deserialize_tdigest, estimate_quantile, latency_digest, merge_digests, RawAggregate, Store};
use crate::error::{MonitorError, MonitorResult};
use crate::scheduler::{truncate_to_window, ROLLUP_WINDOW_SECONDS};

/// Length of a statistics window ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    LastHour,
    Last24Hours,
    Last7Days,
    Last30Days,
    Custom(ChronoDuration),
}

impl TimeRange {
    pub fn duration(&self) -> ChronoDuration {
        match self {
            TimeRange::LastHour => ChronoDuration::hours(1),
            TimeRange::Last24Hours => ChronoDuration::hours(24),
            TimeRange::Last7Days => ChronoDuration::days(7),
            TimeRange::Last30Days => ChronoDuration::days(30),
            TimeRange::Custom(d) => *d,
        }
    }

    pub fn minutes(n: i64) -> MonitorResult<Self> {
        Self::custom(n, ChronoDuration::minutes, "minutes")
    }

    pub fn hours(n: i64) -> MonitorResult<Self> {
        Self::custom(n, ChronoDuration::hours, "hours")
    }

    pub fn days(n: i64) -> MonitorResult<Self> {
        Self::custom(n, ChronoDuration::days, "days")
    }

    fn custom(n: i64, unit: fn(i64) -> ChronoDuration, name: &str) -> MonitorResult<Self> {
        // Cap at ten years so the chrono constructors cannot overflow.
        if n <= 0 || n > 3650 * 24 * 60 {
            return Err(MonitorError::InvalidTarget(format!("{} must be between 1 and 5256000, got {}", name, n)));
        }
        Ok(TimeRange::Custom(unit(n)))
    }
}

impl FromStr for TimeRange {
    type Err = MonitorError;

    /// Accepts `last_hour`, `last_24h`, `last_7d`, `last_30d` (any case, `-` or `_`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "last_hour" | "last_1h" | "1h" => Ok(TimeRange::LastHour),
            "last_24h" | "last_24_hours" | "last_day" | "24h" => Ok(TimeRange::Last24Hours),
            "last_7d" | "last_7_days" | "last_week" | "7d" => Ok(TimeRange::Last7Days),
            "last_30d" | "last_30_days" | "last_month" | "30d" => Ok(TimeRange::Last30Days),
            other => Err(MonitorError::InvalidTarget(format!("unknown time range: {}", other))),
        }
    }
}

/// Aggregate reachability figures for one device over one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatistics {
    pub device_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_pings: i64,
    pub successful_pings: i64,
    pub failed_pings: i64,
    /// Mean over successful pings only.
    pub average_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub uptime_percent: f64,
    pub packet_loss_percent: f64,
    pub p50_response_time: Option<f64>,
    pub p95_response_time: Option<f64>,
    pub p99_response_time: Option<f64>,
}

impl WindowStatistics {
    fn from_parts(
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        agg: RawAggregate,
        digest: Option<TDigest>,
    ) -> Self {
        let failed = agg.total - agg.successful;
        let percent = |n: i64| if agg.total > 0 { n as f64 * 100.0 / agg.total as f64 } else { 0.0 };
        let quantile = |q: f64| digest.as_ref().map(|td| estimate_quantile(td, q));

        Self {
            device_id,
            start,
            end,
            total_pings: agg.total,
            successful_pings: agg.successful,
            failed_pings: failed,
            average_response_time: (agg.successful > 0).then(|| agg.response_time_sum / agg.successful as f64),
            min_response_time: agg.min_response_time,
            max_response_time: agg.max_response_time,
            uptime_percent: percent(agg.successful),
            packet_loss_percent: percent(failed),
            p50_response_time: quantile(0.5),
            p95_response_time: quantile(0.95),
            p99_response_time: quantile(0.99),
        }
    }
}

/// Serves window statistics from raw results and, for ranges older than raw
/// retention, hourly rollups.
pub struct StatisticsAggregator {
    store: Arc<Store>,
    raw_retention: ChronoDuration,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<Store>, raw_retention_days: i64) -> Self {
        Self {
            store,
            raw_retention: ChronoDuration::days(raw_retention_days.max(1)),
        }
    }

    pub fn query(&self, device_id: Uuid, range: TimeRange) -> MonitorResult<WindowStatistics> {
        self.query_at(device_id, range, Utc::now())
    }

    /// Statistics for `[now - range, now]`.
    pub fn query_at(&self, device_id: Uuid, range: TimeRange, now: DateTime<Utc>) -> MonitorResult<WindowStatistics> {
        let start = now - range.duration();
        let raw_cutoff = now - self.raw_retention;

        if start >= raw_cutoff {
            let agg = self.store.aggregate_probe_results(device_id, start, now)?;
            let digest = latency_digest(self.store.probe_latencies(device_id, start, now)?);
            return Ok(WindowStatistics::from_parts(device_id, start, now, agg, digest));
        }

        // Hours before the first hour boundary past the raw cutoff come from
        // rollups; everything after it is still raw. The hour holding `start`
        // is counted whole.
        let boundary = truncate_to_window(raw_cutoff, ROLLUP_WINDOW_SECONDS) + ChronoDuration::seconds(ROLLUP_WINDOW_SECONDS);
        let head = truncate_to_window(start, ROLLUP_WINDOW_SECONDS);
        let rollups = self.store.get_rollups(device_id, ROLLUP_WINDOW_SECONDS, head, boundary)?;

        let mut agg = self.store.aggregate_probe_results(device_id, boundary, now)?;
        let mut digests: Vec<TDigest> = latency_digest(self.store.probe_latencies(device_id, boundary, now)?)
            .into_iter()
            .collect();

        for r in &rollups {
            agg.total += r.total;
            agg.successful += r.successful;
            agg.response_time_sum += r.response_time_sum;
            agg.min_response_time = min_opt(agg.min_response_time, r.min_response_time);
            agg.max_response_time = max_opt(agg.max_response_time, r.max_response_time);
            if let Some(td) = deserialize_tdigest(&r.tdigest_data) {
                digests.push(td);
            }
        }

        Ok(WindowStatistics::from_parts(device_id, start, now, agg, merge_digests(&digests)))
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProbeResult;
    use crate::scheduler::aggregate_window;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn aggregator() -> (NamedTempFile, Arc<Store>, StatisticsAggregator) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let stats = StatisticsAggregator::new(store.clone(), 7);
        (tmp, store, stats)
    }

    #[test]
    fn test_last_hour_roundtrip() {
        let (_tmp, store, stats) = aggregator();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut results = Vec::new();
        for (i, ms) in [40.0, 60.0, 45.0, 55.0, 50.0, 50.0, 30.0, 70.0].into_iter().enumerate() {
            results.push(ProbeResult::success(id, now - ChronoDuration::minutes(5 * i as i64 + 1), ms));
        }
        results.push(ProbeResult::failure(id, now - ChronoDuration::minutes(2), "timeout"));
        results.push(ProbeResult::failure(id, now - ChronoDuration::minutes(3), "unreachable"));
        // Outside the window.
        results.push(ProbeResult::failure(id, now - ChronoDuration::minutes(61), "old"));
        store.add_probe_results(&results).unwrap();

        let s = stats.query_at(id, TimeRange::LastHour, now).unwrap();
        assert_eq!(s.total_pings, 10);
        assert_eq!(s.successful_pings, 8);
        assert_eq!(s.failed_pings, 2);
        assert_eq!(s.uptime_percent, 80.0);
        assert_eq!(s.packet_loss_percent, 20.0);
        assert_eq!(s.average_response_time, Some(50.0));
        assert_eq!(s.min_response_time, Some(30.0));
        assert_eq!(s.max_response_time, Some(70.0));
        let p50 = s.p50_response_time.unwrap();
        assert!((30.0..=70.0).contains(&p50));
    }

    #[test]
    fn test_empty_window_has_zero_uptime() {
        let (_tmp, _store, stats) = aggregator();
        let s = stats.query(Uuid::new_v4(), TimeRange::Last24Hours).unwrap();
        assert_eq!(s.total_pings, 0);
        assert_eq!(s.uptime_percent, 0.0);
        assert_eq!(s.packet_loss_percent, 0.0);
        assert!(s.average_response_time.is_none());
        assert!(s.p99_response_time.is_none());
    }

    #[test]
    fn test_window_end_is_inclusive() {
        let (_tmp, store, stats) = aggregator();
        let id = Uuid::new_v4();
        let now = Utc::now();
        store.add_probe_results(&[ProbeResult::success(id, now, 12.0)]).unwrap();

        let s = stats.query_at(id, TimeRange::minutes(1).unwrap(), now).unwrap();
        assert_eq!(s.total_pings, 1);
    }

    #[test]
    fn test_long_range_reads_rollups() {
        let (_tmp, store, stats) = aggregator();
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Ten days ago: raw rows are gone, only the hourly rollup remains.
        let hour = truncate_to_window(now - ChronoDuration::days(10), ROLLUP_WINDOW_SECONDS);
        let old = vec![
            ProbeResult::success(id, hour, 100.0),
            ProbeResult::success(id, hour, 300.0),
            ProbeResult::failure(id, hour, "timeout"),
        ];
        store.add_rollups(&[aggregate_window(id, ROLLUP_WINDOW_SECONDS, hour, &old)]).unwrap();
        store.add_probe_results(&[ProbeResult::success(id, now - ChronoDuration::hours(1), 20.0)]).unwrap();

        let s = stats.query_at(id, TimeRange::Last30Days, now).unwrap();
        assert_eq!(s.total_pings, 4);
        assert_eq!(s.successful_pings, 3);
        assert_eq!(s.average_response_time, Some(140.0));
        assert_eq!(s.min_response_time, Some(20.0));
        assert_eq!(s.max_response_time, Some(300.0));
        assert!(s.p95_response_time.unwrap() > 20.0);

        // A 7-day window does not reach the rollup.
        let s = stats.query_at(id, TimeRange::Last7Days, now).unwrap();
        assert_eq!(s.total_pings, 1);
    }

    #[test]
    fn test_long_range_counts_head_hour() {
        let (_tmp, store, stats) = aggregator();
        let id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 0).unwrap();

        // The window starts at 12:30 eight days back; its hour began at 12:00.
        let hour = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let probes: Vec<ProbeResult> = (0..5)
            .map(|_| ProbeResult::success(id, hour + ChronoDuration::minutes(40), 25.0))
            .collect();
        store.add_rollups(&[aggregate_window(id, ROLLUP_WINDOW_SECONDS, hour, &probes)]).unwrap();

        let s = stats.query_at(id, TimeRange::days(8).unwrap(), now).unwrap();
        assert_eq!(s.total_pings, 5);
        assert_eq!(s.successful_pings, 5);
        assert_eq!(s.average_response_time, Some(25.0));
    }

    #[test]
    fn test_time_range_parsing() {
        assert_eq!("LAST_HOUR".parse::<TimeRange>().unwrap(), TimeRange::LastHour);
        assert_eq!("last-24h".parse::<TimeRange>().unwrap(), TimeRange::Last24Hours);
        assert_eq!("last_7d".parse::<TimeRange>().unwrap(), TimeRange::Last7Days);
        assert_eq!("last_30_days".parse::<TimeRange>().unwrap(), TimeRange::Last30Days);
        assert!("yesterday".parse::<TimeRange>().is_err());

        assert_eq!(TimeRange::minutes(90).unwrap().duration(), ChronoDuration::minutes(90));
        assert_eq!(TimeRange::hours(2).unwrap().duration(), ChronoDuration::hours(2));
        assert_eq!(TimeRange::days(3).unwrap().duration(), ChronoDuration::days(3));
        assert!(TimeRange::minutes(0).is_err());
        assert!(TimeRange::days(-1).is_err());
    }
}
