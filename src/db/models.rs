//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A device enrolled for periodic reachability probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    pub device_id: Uuid,
    pub address: String,
    pub interval_seconds: u32,
    pub monitored: bool,
    /// Bumped on every re-arm so stale in-flight ticks can be recognised.
    #[serde(skip)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Local copy of a device inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl DeviceRecord {
    /// Address to probe: hostname wins over IP when both are set.
    pub fn probe_address(&self) -> Option<&str> {
        [self.hostname.as_deref(), self.ip_address.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Round trip in milliseconds, present iff `success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    /// Present iff `!success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProbeResult {
    pub fn success(device_id: Uuid, timestamp: DateTime<Utc>, response_time_ms: f64) -> Self {
        Self {
            device_id,
            timestamp,
            success: true,
            response_time_ms: Some(response_time_ms),
            error_message: None,
        }
    }

    pub fn failure(device_id: Uuid, timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            device_id,
            timestamp,
            success: false,
            response_time_ms: None,
            error_message: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Unknown,
    Online,
    Offline,
    NotMonitored,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Online => "ONLINE",
            Status::Offline => "OFFLINE",
            Status::NotMonitored => "NOT_MONITORED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Status::Unknown),
            "ONLINE" => Ok(Status::Online),
            "OFFLINE" => Ok(Status::Offline),
            "NOT_MONITORED" => Ok(Status::NotMonitored),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Debounced reachability status of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: Uuid,
    pub status: Status,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_response_time_ms: Option<f64>,
    pub last_status_change: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    pub fn new(device_id: Uuid) -> Self {
        Self {
            device_id,
            status: Status::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_response_time_ms: None,
            last_status_change: None,
        }
    }
}

/// A status transition as published to subscribers and the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusUpdate {
    pub device_id: Uuid,
    pub previous_status: Status,
    pub current_status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    DeviceDown,
    DeviceRecovered,
    HighResponseTime,
    PacketLoss,
    Custom,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::DeviceDown => "DEVICE_DOWN",
            AlertType::DeviceRecovered => "DEVICE_RECOVERED",
            AlertType::HighResponseTime => "HIGH_RESPONSE_TIME",
            AlertType::PacketLoss => "PACKET_LOSS",
            AlertType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVICE_DOWN" => Ok(AlertType::DeviceDown),
            "DEVICE_RECOVERED" => Ok(AlertType::DeviceRecovered),
            "HIGH_RESPONSE_TIME" => Ok(AlertType::HighResponseTime),
            "PACKET_LOSS" => Ok(AlertType::PacketLoss),
            "CUSTOM" => Ok(AlertType::Custom),
            other => Err(format!("unknown alert type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub device_id: Uuid,
    pub alert_type: AlertType,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(device_id: Uuid, alert_type: AlertType, message: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            alert_type,
            message: message.into(),
            created_at,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        }
    }
}

/// Filter for alert listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFilter {
    #[serde(default)]
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub unresolved_only: bool,
}

/// Alert counts for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatistics {
    pub total: i64,
    pub unresolved: i64,
    pub unacknowledged: i64,
}

/// Hourly (or other window) aggregate of raw probe results.
#[derive(Debug, Clone)]
pub struct ProbeRollup {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub window_seconds: i64,
    pub total: i64,
    pub successful: i64,
    pub response_time_sum: f64,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub tdigest_data: Vec<u8>,
}

/// Counts and latency aggregates over a set of raw rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawAggregate {
    pub total: i64,
    pub successful: i64,
    pub response_time_sum: f64,
    pub min_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
}

/// Raw results statistics for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub db_size_bytes: i64,
    pub raw_results: i64,
    pub rollups: i64,
    pub alerts: i64,
}
