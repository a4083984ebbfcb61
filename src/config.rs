//! Configuration module for PingWarden.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingwarden.db")
    pub db_path: String,
    pub monitor: MonitorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingwarden.db".to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Which network check the probe executor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// ICMP echo, falling back to the system `ping` command.
    Icmp,
    /// TCP connect to the given port when the address carries none.
    Tcp { default_port: u16 },
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" | "ping" => Ok(ProbeKind::Icmp),
            "tcp" => Ok(ProbeKind::Tcp { default_port: 80 }),
            other => match other.strip_prefix("tcp:") {
                Some(port) => port
                    .parse()
                    .map(|default_port| ProbeKind::Tcp { default_port })
                    .map_err(|_| format!("invalid tcp port: {}", port)),
                None => Err(format!("unknown probe kind: {}", other)),
            },
        }
    }
}

/// Thresholds and limits for the monitoring engine.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive failures before a device is reported OFFLINE.
    pub failure_threshold: u32,
    /// Consecutive successes before a device is reported ONLINE.
    pub recovery_threshold: u32,
    pub high_latency_threshold_ms: f64,
    /// Consecutive fast probes that auto-resolve a HIGH_RESPONSE_TIME alert.
    pub latency_recovery_probes: u32,
    /// Number of recent probes in the packet-loss window.
    pub packet_loss_window: usize,
    pub packet_loss_threshold_percent: f64,
    pub alerting_enabled: bool,
    /// Maximum probes in flight across all devices.
    pub worker_pool_size: usize,
    pub default_interval_seconds: u32,
    pub min_interval_seconds: u32,
    pub max_interval_seconds: u32,
    /// Fixed probe timeout. When unset: 2x the shorter of 5s and the interval.
    pub probe_timeout: Option<Duration>,
    pub probe_kind: ProbeKind,
    pub raw_retention_days: i64,
    pub rollup_retention_days: i64,
    pub alert_retention_days: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            high_latency_threshold_ms: 120.0,
            latency_recovery_probes: 3,
            packet_loss_window: 10,
            packet_loss_threshold_percent: 20.0,
            alerting_enabled: true,
            worker_pool_size: 64,
            default_interval_seconds: 5,
            min_interval_seconds: 1,
            max_interval_seconds: 3600,
            probe_timeout: None,
            probe_kind: ProbeKind::Icmp,
            raw_retention_days: 7,
            rollup_retention_days: 365,
            alert_retention_days: 90,
        }
    }
}

impl MonitorConfig {
    /// Timeout applied to a probe of a target with the given interval.
    pub fn probe_timeout_for(&self, interval_seconds: u32) -> Duration {
        self.probe_timeout.unwrap_or_else(|| {
            let base = Duration::from_secs(u64::from(interval_seconds)).min(Duration::from_secs(5));
            base * 2
        })
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGWARDEN_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PINGWARDEN_DB_PATH`: Database file path (default: "pingwarden.db")
    /// - `PINGWARDEN_FAILURE_THRESHOLD`, `PINGWARDEN_RECOVERY_THRESHOLD`
    /// - `PINGWARDEN_HIGH_LATENCY_MS`, `PINGWARDEN_LATENCY_RECOVERY_PROBES`
    /// - `PINGWARDEN_PACKET_LOSS_WINDOW`, `PINGWARDEN_PACKET_LOSS_PERCENT`
    /// - `PINGWARDEN_ALERTING_ENABLED`
    /// - `PINGWARDEN_WORKERS`, `PINGWARDEN_DEFAULT_INTERVAL`
    /// - `PINGWARDEN_PROBE_TIMEOUT_MS`, `PINGWARDEN_PROBE_KIND` (`icmp`, `tcp`, `tcp:<port>`)
    /// - `PINGWARDEN_RAW_RETENTION_DAYS`, `PINGWARDEN_ROLLUP_RETENTION_DAYS`,
    ///   `PINGWARDEN_ALERT_RETENTION_DAYS`
    pub fn load() -> Self {
        let mut cfg = Self::default();

        env_override("PINGWARDEN_HTTP_PORT", &mut cfg.http_port);
        if let Ok(db_path) = env::var("PINGWARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }

        let m = &mut cfg.monitor;
        env_override("PINGWARDEN_FAILURE_THRESHOLD", &mut m.failure_threshold);
        env_override("PINGWARDEN_RECOVERY_THRESHOLD", &mut m.recovery_threshold);
        env_override("PINGWARDEN_HIGH_LATENCY_MS", &mut m.high_latency_threshold_ms);
        env_override("PINGWARDEN_LATENCY_RECOVERY_PROBES", &mut m.latency_recovery_probes);
        env_override("PINGWARDEN_PACKET_LOSS_WINDOW", &mut m.packet_loss_window);
        env_override("PINGWARDEN_PACKET_LOSS_PERCENT", &mut m.packet_loss_threshold_percent);
        env_override("PINGWARDEN_ALERTING_ENABLED", &mut m.alerting_enabled);
        env_override("PINGWARDEN_WORKERS", &mut m.worker_pool_size);
        env_override("PINGWARDEN_DEFAULT_INTERVAL", &mut m.default_interval_seconds);
        env_override("PINGWARDEN_PROBE_KIND", &mut m.probe_kind);
        env_override("PINGWARDEN_RAW_RETENTION_DAYS", &mut m.raw_retention_days);
        env_override("PINGWARDEN_ROLLUP_RETENTION_DAYS", &mut m.rollup_retention_days);
        env_override("PINGWARDEN_ALERT_RETENTION_DAYS", &mut m.alert_retention_days);

        let mut timeout_ms: u64 = 0;
        env_override("PINGWARDEN_PROBE_TIMEOUT_MS", &mut timeout_ms);
        if timeout_ms > 0 {
            m.probe_timeout = Some(Duration::from_millis(timeout_ms));
        }

        m.failure_threshold = m.failure_threshold.max(1);
        m.recovery_threshold = m.recovery_threshold.max(1);
        m.worker_pool_size = m.worker_pool_size.max(1);
        m.packet_loss_window = m.packet_loss_window.max(1);

        cfg
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {}", key, raw),
        }
    }
}
