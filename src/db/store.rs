//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const ALERT_COLUMNS: &str = "id, device_id, alert_type, message, created_at, acknowledged, \
     acknowledged_by, acknowledged_at, resolved, resolved_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| DbError::Migration(format!("Failed to enable WAL: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Devices (local inventory cache) ---

    /// Insert or replace a device inventory record.
    pub fn upsert_device(&self, device: &DeviceRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (device_id, name, ip_address, hostname, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO UPDATE SET
             name=excluded.name, ip_address=excluded.ip_address, hostname=excluded.hostname, updated_at=excluded.updated_at",
            params![
                device.device_id.to_string(),
                device.name,
                device.ip_address,
                device.hostname,
                fmt_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_device(&self, device_id: Uuid) -> Result<Option<DeviceRecord>, DbError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT device_id, name, ip_address, hostname FROM devices WHERE device_id = ?1",
                params![device_id.to_string()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub fn get_devices(&self) -> Result<Vec<DeviceRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT device_id, name, ip_address, hostname FROM devices ORDER BY name")?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Delete a device and everything recorded for it.
    pub fn delete_device_data(&self, device_id: Uuid) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let id = device_id.to_string();
        tx.execute("DELETE FROM probe_results WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM probe_rollups WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM status_changes WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM alerts WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM targets WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM devices WHERE device_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // --- Targets ---

    /// Insert or update a monitoring target.
    pub fn upsert_target(&self, target: &MonitoringTarget) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (device_id, address, interval_seconds, monitored, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
             address=excluded.address, interval_seconds=excluded.interval_seconds,
             monitored=excluded.monitored, updated_at=excluded.updated_at",
            params![
                target.device_id.to_string(),
                target.address,
                target.interval_seconds,
                target.monitored,
                fmt_time(target.created_at),
                fmt_time(target.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get all targets, monitored or not.
    pub fn get_targets(&self) -> Result<Vec<MonitoringTarget>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, address, interval_seconds, monitored, created_at, updated_at FROM targets",
        )?;
        let targets = stmt
            .query_map([], |row| {
                Ok(MonitoringTarget {
                    device_id: uuid_col(row, 0)?,
                    address: row.get(1)?,
                    interval_seconds: row.get(2)?,
                    monitored: row.get(3)?,
                    generation: 0,
                    created_at: time_col(row, 4)?,
                    updated_at: time_col(row, 5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    // --- Probe results ---

    /// Add probe results in batch.
    pub fn add_probe_results(&self, results: &[ProbeResult]) -> Result<(), DbError> {
        if results.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_results (time, device_id, success, response_time_ms, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for r in results {
                stmt.execute(params![
                    fmt_time(r.timestamp),
                    r.device_id.to_string(),
                    r.success,
                    r.response_time_ms,
                    r.error_message,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get probe results for a device within `[start, end)`, oldest first.
    pub fn get_probe_results(
        &self,
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, device_id, success, response_time_ms, error_message FROM probe_results
             WHERE device_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC LIMIT ?4",
        )?;
        let results = stmt
            .query_map(
                params![device_id.to_string(), fmt_time(start), fmt_time(end), limit],
                probe_result_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Most recent probe results for a device, newest first.
    pub fn recent_probe_results(&self, device_id: Uuid, limit: i64) -> Result<Vec<ProbeResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, device_id, success, response_time_ms, error_message FROM probe_results
             WHERE device_id = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![device_id.to_string(), limit], probe_result_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    /// Aggregate raw rows with `start <= time <= end`.
    pub fn aggregate_probe_results(
        &self,
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawAggregate, DbError> {
        let conn = self.conn()?;
        let agg = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0),
                    COALESCE(SUM(CASE WHEN success = 1 THEN response_time_ms END), 0.0),
                    MIN(CASE WHEN success = 1 THEN response_time_ms END),
                    MAX(CASE WHEN success = 1 THEN response_time_ms END)
             FROM probe_results WHERE device_id = ?1 AND time >= ?2 AND time <= ?3",
            params![device_id.to_string(), fmt_time(start), fmt_time(end)],
            |row| {
                Ok(RawAggregate {
                    total: row.get(0)?,
                    successful: row.get(1)?,
                    response_time_sum: row.get(2)?,
                    min_response_time: row.get(3)?,
                    max_response_time: row.get(4)?,
                })
            },
        )?;
        Ok(agg)
    }

    /// Response times of successful probes with `start <= time <= end`.
    pub fn probe_latencies(
        &self,
        device_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<f64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT response_time_ms FROM probe_results
             WHERE device_id = ?1 AND success = 1 AND response_time_ms IS NOT NULL
             AND time >= ?2 AND time <= ?3",
        )?;
        let values = stmt
            .query_map(params![device_id.to_string(), fmt_time(start), fmt_time(end)], |row| row.get(0))?
            .collect::<SqlResult<Vec<f64>>>()?;
        Ok(values)
    }

    /// Get earliest probe result time for a device.
    pub fn get_earliest_probe_time(&self, device_id: Uuid) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM probe_results WHERE device_id = ?1",
            params![device_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete probe results before a cutoff time, for every device.
    pub fn delete_probe_results_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM probe_results WHERE time < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Rollups ---

    /// Add rollups in batch, replacing any existing row for the same window.
    pub fn add_rollups(&self, rollups: &[ProbeRollup]) -> Result<(), DbError> {
        if rollups.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO probe_rollups (time, device_id, window_seconds, total, successful,
                     response_time_sum, min_response_time, max_response_time, tdigest_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(time, device_id, window_seconds) DO UPDATE SET
                 total=excluded.total, successful=excluded.successful,
                 response_time_sum=excluded.response_time_sum,
                 min_response_time=excluded.min_response_time,
                 max_response_time=excluded.max_response_time,
                 tdigest_data=excluded.tdigest_data",
            )?;

            for r in rollups {
                stmt.execute(params![
                    fmt_time(r.time),
                    r.device_id.to_string(),
                    r.window_seconds,
                    r.total,
                    r.successful,
                    r.response_time_sum,
                    r.min_response_time,
                    r.max_response_time,
                    r.tdigest_data,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Rollups whose window starts within `[start, end)`.
    pub fn get_rollups(
        &self,
        device_id: Uuid,
        window_seconds: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeRollup>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, device_id, window_seconds, total, successful, response_time_sum,
                    min_response_time, max_response_time, tdigest_data
             FROM probe_rollups
             WHERE device_id = ?1 AND window_seconds = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time ASC",
        )?;
        let rollups = stmt
            .query_map(
                params![device_id.to_string(), window_seconds, fmt_time(start), fmt_time(end)],
                |row| {
                    Ok(ProbeRollup {
                        time: time_col(row, 0)?,
                        device_id: uuid_col(row, 1)?,
                        window_seconds: row.get(2)?,
                        total: row.get(3)?,
                        successful: row.get(4)?,
                        response_time_sum: row.get(5)?,
                        min_response_time: row.get(6)?,
                        max_response_time: row.get(7)?,
                        tdigest_data: row.get::<_, Option<Vec<u8>>>(8)?.unwrap_or_default(),
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rollups)
    }

    /// Get the start of the most recent rollup for a device and window.
    pub fn get_last_rollup_time(&self, device_id: Uuid, window_seconds: i64) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MAX(time) FROM probe_rollups WHERE device_id = ?1 AND window_seconds = ?2",
            params![device_id.to_string(), window_seconds],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete rollups of one window size before a cutoff.
    pub fn delete_rollups_before(&self, window_seconds: i64, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM probe_rollups WHERE window_seconds = ?1 AND time < ?2",
            params![window_seconds, fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Status history ---

    pub fn add_status_change(&self, update: &DeviceStatusUpdate) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO status_changes (time, device_id, previous_status, current_status) VALUES (?1, ?2, ?3, ?4)",
            params![
                fmt_time(update.timestamp),
                update.device_id.to_string(),
                update.previous_status.as_str(),
                update.current_status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_status_changes(&self, device_id: Uuid) -> Result<Vec<DeviceStatusUpdate>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT time, device_id, previous_status, current_status FROM status_changes
             WHERE device_id = ?1 ORDER BY time ASC, rowid ASC",
        )?;
        let changes = stmt
            .query_map(params![device_id.to_string()], |row| {
                Ok(DeviceStatusUpdate {
                    timestamp: time_col(row, 0)?,
                    device_id: uuid_col(row, 1)?,
                    previous_status: parsed_col(row, 2)?,
                    current_status: parsed_col(row, 3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(changes)
    }

    // --- Alerts ---

    pub fn insert_alert(&self, alert: &Alert) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO alerts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)", ALERT_COLUMNS),
            params![
                alert.id.to_string(),
                alert.device_id.to_string(),
                alert.alert_type.as_str(),
                alert.message,
                fmt_time(alert.created_at),
                alert.acknowledged,
                alert.acknowledged_by,
                alert.acknowledged_at.map(fmt_time),
                alert.resolved,
                alert.resolved_at.map(fmt_time),
            ],
        )?;
        Ok(())
    }

    /// Persist the lifecycle fields of an existing alert.
    pub fn update_alert_lifecycle(&self, alert: &Alert) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alerts SET acknowledged=?1, acknowledged_by=?2, acknowledged_at=?3, resolved=?4, resolved_at=?5
             WHERE id=?6",
            params![
                alert.acknowledged,
                alert.acknowledged_by,
                alert.acknowledged_at.map(fmt_time),
                alert.resolved,
                alert.resolved_at.map(fmt_time),
                alert.id.to_string(),
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, DbError> {
        let conn = self.conn()?;
        let alert = conn
            .query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                params![id.to_string()],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    /// Hard delete. Returns whether a row was removed.
    pub fn delete_alert(&self, id: Uuid) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM alerts WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    /// List alerts, newest first.
    pub fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM alerts WHERE 1=1", ALERT_COLUMNS);
        if filter.device_id.is_some() {
            sql.push_str(" AND device_id = ?1");
        }
        if filter.unresolved_only {
            sql.push_str(" AND resolved = 0");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let alerts = match filter.device_id {
            Some(id) => stmt.query_map(params![id.to_string()], alert_from_row)?.collect::<SqlResult<Vec<_>>>()?,
            None => stmt.query_map([], alert_from_row)?.collect::<SqlResult<Vec<_>>>()?,
        };
        Ok(alerts)
    }

    /// Unresolved alerts of one type for a device, oldest first.
    pub fn open_alerts(&self, device_id: Uuid, alert_type: AlertType) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE device_id = ?1 AND alert_type = ?2 AND resolved = 0 ORDER BY created_at ASC",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![device_id.to_string(), alert_type.as_str()], alert_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    pub fn get_alert_statistics(&self) -> Result<AlertStatistics, DbError> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN acknowledged = 0 THEN 1 ELSE 0 END), 0)
             FROM alerts",
            [],
            |row| {
                Ok(AlertStatistics {
                    total: row.get(0)?,
                    unresolved: row.get(1)?,
                    unacknowledged: row.get(2)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Delete resolved alerts created before a cutoff. Open alerts are kept.
    pub fn delete_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM alerts WHERE resolved = 1 AND created_at < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Status endpoint ---

    pub fn get_storage_stats(&self) -> Result<StorageStats, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let raw_results: i64 = conn.query_row("SELECT COUNT(*) FROM probe_results", [], |r| r.get(0))?;
        let rollups: i64 = conn.query_row("SELECT COUNT(*) FROM probe_rollups", [], |r| r.get(0))?;
        let alerts: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |r| r.get(0))?;
        Ok(StorageStats {
            db_size_bytes: page_count * page_size,
            raw_results,
            rollups,
            alerts,
        })
    }
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(DbError::Corrupt(msg)),
    )
}

fn uuid_col(row: &Row<'_>, idx: usize) -> SqlResult<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, format!("bad uuid {}: {}", s, e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", s)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", s))),
        None => Ok(None),
    }
}

fn parsed_col<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn device_from_row(row: &Row<'_>) -> SqlResult<DeviceRecord> {
    Ok(DeviceRecord {
        device_id: uuid_col(row, 0)?,
        name: row.get(1)?,
        ip_address: row.get(2)?,
        hostname: row.get(3)?,
    })
}

fn probe_result_from_row(row: &Row<'_>) -> SqlResult<ProbeResult> {
    Ok(ProbeResult {
        timestamp: time_col(row, 0)?,
        device_id: uuid_col(row, 1)?,
        success: row.get(2)?,
        response_time_ms: row.get(3)?,
        error_message: row.get(4)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> SqlResult<Alert> {
    Ok(Alert {
        id: uuid_col(row, 0)?,
        device_id: uuid_col(row, 1)?,
        alert_type: parsed_col(row, 2)?,
        message: row.get(3)?,
        created_at: time_col(row, 4)?,
        acknowledged: row.get(5)?,
        acknowledged_by: row.get(6)?,
        acknowledged_at: opt_time_col(row, 7)?,
        resolved: row.get(8)?,
        resolved_at: opt_time_col(row, 9)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
