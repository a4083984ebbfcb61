//! Alert rules and lifecycle.
//!
//! Rules are edge-triggered: a condition opens one alert and further samples
//! are suppressed until that alert is resolved, either by an operator or by
//! the condition clearing. The store is the source of truth for what is open;
//! the per-device [`AlertTracker`] only caches ids and rolling windows.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::db::{Alert, AlertFilter, AlertStatistics, AlertType, DeviceStatusUpdate, ProbeResult, Status, Store};
use crate::error::{MonitorError, MonitorResult};

/// An alert the engine created or changed, for the event feed.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertChange {
    Created(Alert),
    Updated(Alert),
}

/// Per-device rule state. Owned by the device pipeline.
#[derive(Debug, Default)]
pub struct AlertTracker {
    primed: bool,
    latency_alert: Option<Uuid>,
    fast_streak: u32,
    loss_alert: Option<Uuid>,
    window: VecDeque<bool>,
}

impl AlertTracker {
    /// Failure percentage over the window, once the window is full.
    fn loss_percent(&self, size: usize) -> Option<f64> {
        if self.window.len() < size || size == 0 {
            return None;
        }
        let failed = self.window.iter().filter(|ok| !**ok).count();
        Some(failed as f64 * 100.0 / self.window.len() as f64)
    }
}

#[derive(Debug, Clone, Copy)]
struct AlertRules {
    enabled: bool,
    high_latency_threshold_ms: f64,
    latency_recovery_probes: u32,
    packet_loss_window: usize,
    packet_loss_threshold_percent: f64,
}

pub struct AlertEngine {
    store: Arc<Store>,
    rules: AlertRules,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>, config: &MonitorConfig) -> Self {
        Self {
            store,
            rules: AlertRules {
                enabled: config.alerting_enabled,
                high_latency_threshold_ms: config.high_latency_threshold_ms,
                latency_recovery_probes: config.latency_recovery_probes.max(1),
                packet_loss_window: config.packet_loss_window.max(1),
                packet_loss_threshold_percent: config.packet_loss_threshold_percent,
            },
        }
    }

    /// Apply the transition rules to a status change.
    pub fn on_status_change(&self, update: &DeviceStatusUpdate) -> MonitorResult<Vec<AlertChange>> {
        let mut changes = Vec::new();
        if !self.rules.enabled {
            return Ok(changes);
        }

        match (update.previous_status, update.current_status) {
            (_, Status::Offline) => {
                // One open DEVICE_DOWN per device, even across restarts.
                if self.store.open_alerts(update.device_id, AlertType::DeviceDown)?.is_empty() {
                    let alert = self.create(
                        update.device_id,
                        AlertType::DeviceDown,
                        "Device not responding to ping",
                        update.timestamp,
                    )?;
                    changes.push(AlertChange::Created(alert));
                }
            }
            (previous, Status::Online) => {
                let open_down = self.store.open_alerts(update.device_id, AlertType::DeviceDown)?;
                if previous == Status::Offline {
                    let alert = self.create(
                        update.device_id,
                        AlertType::DeviceRecovered,
                        "Device responding normally to ping",
                        update.timestamp,
                    )?;
                    changes.push(AlertChange::Created(alert));
                }
                for mut down in open_down {
                    mark_resolved(&mut down, update.timestamp);
                    self.store.update_alert_lifecycle(&down)?;
                    changes.push(AlertChange::Updated(down));
                }
            }
            _ => {}
        }

        Ok(changes)
    }

    /// Apply the latency and packet-loss rules to one probe result.
    pub fn on_probe(&self, tracker: &mut AlertTracker, result: &ProbeResult) -> MonitorResult<Vec<AlertChange>> {
        let mut changes = Vec::new();
        if !self.rules.enabled {
            return Ok(changes);
        }

        if !tracker.primed {
            tracker.latency_alert = self.first_open(result.device_id, AlertType::HighResponseTime)?;
            tracker.loss_alert = self.first_open(result.device_id, AlertType::PacketLoss)?;
            tracker.primed = true;
        }

        self.check_latency(tracker, result, &mut changes)?;
        self.check_packet_loss(tracker, result, &mut changes)?;

        Ok(changes)
    }

    fn check_latency(
        &self,
        tracker: &mut AlertTracker,
        result: &ProbeResult,
        changes: &mut Vec<AlertChange>,
    ) -> MonitorResult<()> {
        let rt = match (result.success, result.response_time_ms) {
            (true, Some(rt)) => rt,
            _ => return Ok(()),
        };
        let threshold = self.rules.high_latency_threshold_ms;

        if rt > threshold {
            tracker.fast_streak = 0;
            if let Some(id) = tracker.latency_alert {
                if !self.still_open(id)? {
                    tracker.latency_alert = None;
                }
            }
            if tracker.latency_alert.is_none() {
                let alert = self.create(
                    result.device_id,
                    AlertType::HighResponseTime,
                    format!("Response time {:.1} ms exceeds threshold of {:.0} ms", rt, threshold),
                    result.timestamp,
                )?;
                tracker.latency_alert = Some(alert.id);
                changes.push(AlertChange::Created(alert));
            }
        } else if let Some(id) = tracker.latency_alert {
            tracker.fast_streak += 1;
            if tracker.fast_streak >= self.rules.latency_recovery_probes {
                tracker.latency_alert = None;
                tracker.fast_streak = 0;
                if let Some(alert) = self.auto_resolve(id, result.timestamp)? {
                    changes.push(AlertChange::Updated(alert));
                }
            }
        }

        Ok(())
    }

    fn check_packet_loss(
        &self,
        tracker: &mut AlertTracker,
        result: &ProbeResult,
        changes: &mut Vec<AlertChange>,
    ) -> MonitorResult<()> {
        let size = self.rules.packet_loss_window;
        tracker.window.push_back(result.success);
        while tracker.window.len() > size {
            tracker.window.pop_front();
        }

        let loss = match tracker.loss_percent(size) {
            Some(loss) => loss,
            None => return Ok(()),
        };
        let threshold = self.rules.packet_loss_threshold_percent;

        if let Some(id) = tracker.loss_alert {
            if loss <= threshold {
                tracker.loss_alert = None;
                if let Some(alert) = self.auto_resolve(id, result.timestamp)? {
                    changes.push(AlertChange::Updated(alert));
                }
                return Ok(());
            }
            if !self.still_open(id)? {
                tracker.loss_alert = None;
            }
        }

        if loss > threshold && tracker.loss_alert.is_none() {
            let alert = self.create(
                result.device_id,
                AlertType::PacketLoss,
                format!("Packet loss {:.0}% over last {} probes exceeds {:.0}%", loss, size, threshold),
                result.timestamp,
            )?;
            tracker.loss_alert = Some(alert.id);
            changes.push(AlertChange::Created(alert));
        }

        Ok(())
    }

    /// Acknowledge an alert. Acknowledging twice keeps the first actor and time.
    pub fn acknowledge(&self, id: Uuid, actor: &str, now: DateTime<Utc>) -> MonitorResult<(Alert, bool)> {
        let mut alert = self.load(id)?;
        if alert.resolved {
            return Err(MonitorError::AlreadyResolved(id));
        }
        if alert.acknowledged {
            return Ok((alert, false));
        }

        alert.acknowledged = true;
        alert.acknowledged_by = Some(actor.to_string());
        alert.acknowledged_at = Some(now);
        self.store.update_alert_lifecycle(&alert)?;
        tracing::info!("Alert {} acknowledged by {}", id, actor);
        Ok((alert, true))
    }

    /// Resolve an alert. Resolving a resolved alert changes nothing.
    pub fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> MonitorResult<(Alert, bool)> {
        let mut alert = self.load(id)?;
        if alert.resolved {
            return Ok((alert, false));
        }

        mark_resolved(&mut alert, now);
        self.store.update_alert_lifecycle(&alert)?;
        tracing::info!("Alert {} resolved", id);
        Ok((alert, true))
    }

    pub fn delete(&self, id: Uuid) -> MonitorResult<()> {
        if !self.store.delete_alert(id)? {
            return Err(MonitorError::alert_not_found(id));
        }
        tracing::info!("Alert {} deleted", id);
        Ok(())
    }

    /// Operator-raised alert.
    pub fn create_custom(&self, device_id: Uuid, message: &str, now: DateTime<Utc>) -> MonitorResult<Alert> {
        let message = message.trim();
        if message.is_empty() {
            return Err(MonitorError::InvalidTarget("alert message must not be empty".to_string()));
        }
        self.create(device_id, AlertType::Custom, message, now)
    }

    pub fn list(&self, filter: &AlertFilter) -> MonitorResult<Vec<Alert>> {
        Ok(self.store.list_alerts(filter)?)
    }

    pub fn statistics(&self) -> MonitorResult<AlertStatistics> {
        Ok(self.store.get_alert_statistics()?)
    }

    fn create(
        &self,
        device_id: Uuid,
        alert_type: AlertType,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> MonitorResult<Alert> {
        let alert = Alert::new(device_id, alert_type, message, at);
        self.store.insert_alert(&alert)?;
        tracing::info!("Alert {} created for {}: {}", alert.alert_type, device_id, alert.message);
        Ok(alert)
    }

    fn load(&self, id: Uuid) -> MonitorResult<Alert> {
        self.store.get_alert(id)?.ok_or_else(|| MonitorError::alert_not_found(id))
    }

    fn first_open(&self, device_id: Uuid, alert_type: AlertType) -> MonitorResult<Option<Uuid>> {
        Ok(self.store.open_alerts(device_id, alert_type)?.first().map(|a| a.id))
    }

    fn still_open(&self, id: Uuid) -> MonitorResult<bool> {
        Ok(self.store.get_alert(id)?.is_some_and(|a| !a.resolved))
    }

    /// Resolve if still open; a deleted or already-resolved alert is skipped.
    fn auto_resolve(&self, id: Uuid, at: DateTime<Utc>) -> MonitorResult<Option<Alert>> {
        match self.store.get_alert(id)? {
            Some(mut alert) if !alert.resolved => {
                mark_resolved(&mut alert, at);
                self.store.update_alert_lifecycle(&alert)?;
                tracing::info!("Alert {} auto-resolved for {}", alert.alert_type, alert.device_id);
                Ok(Some(alert))
            }
            _ => Ok(None),
        }
    }
}

fn mark_resolved(alert: &mut Alert, at: DateTime<Utc>) {
    alert.resolved = true;
    alert.resolved_at = Some(at);
}
