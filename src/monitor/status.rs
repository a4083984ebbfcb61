//! Per-device status state machine with hysteresis.

use chrono::{DateTime, Utc};

use crate::db::{DeviceStatus, DeviceStatusUpdate, ProbeResult, Status};

/// Applies probe outcomes to a [`DeviceStatus`].
///
/// A device only flips to OFFLINE after `failure_threshold` consecutive
/// failures and back to ONLINE after `recovery_threshold` consecutive
/// successes; anything shorter just moves the counters.
#[derive(Debug, Clone, Copy)]
pub struct StatusMachine {
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl StatusMachine {
    pub fn new(failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    /// Fold one probe result into `status`. Returns the transition, if any.
    pub fn apply(&self, status: &mut DeviceStatus, result: &ProbeResult) -> Option<DeviceStatusUpdate> {
        if status.status == Status::NotMonitored {
            return None;
        }

        let previous = status.status;
        let next = if result.success {
            status.consecutive_successes = status.consecutive_successes.saturating_add(1);
            status.consecutive_failures = 0;
            status.last_response_time_ms = result.response_time_ms;

            match previous {
                Status::Offline | Status::Unknown if status.consecutive_successes >= self.recovery_threshold => {
                    Status::Online
                }
                _ => previous,
            }
        } else {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.consecutive_successes = 0;

            match previous {
                Status::Online | Status::Unknown if status.consecutive_failures >= self.failure_threshold => {
                    Status::Offline
                }
                _ => previous,
            }
        };

        if next == previous {
            return None;
        }
        Some(self.transition(status, next, result.timestamp))
    }

    /// Administrative stop: NOT_MONITORED with counters cleared.
    pub fn stop(&self, status: &mut DeviceStatus, at: DateTime<Utc>) -> Option<DeviceStatusUpdate> {
        status.consecutive_successes = 0;
        status.consecutive_failures = 0;
        if status.status == Status::NotMonitored {
            return None;
        }
        Some(self.transition(status, Status::NotMonitored, at))
    }

    /// Leave NOT_MONITORED when monitoring is started again.
    pub fn restart(&self, status: &mut DeviceStatus, at: DateTime<Utc>) -> Option<DeviceStatusUpdate> {
        if status.status != Status::NotMonitored {
            return None;
        }
        *status = DeviceStatus::new(status.device_id);
        status.status = Status::NotMonitored;
        Some(self.transition(status, Status::Unknown, at))
    }

    fn transition(&self, status: &mut DeviceStatus, next: Status, at: DateTime<Utc>) -> DeviceStatusUpdate {
        let update = DeviceStatusUpdate {
            device_id: status.device_id,
            previous_status: status.status,
            current_status: next,
            timestamp: at,
        };
        status.status = next;
        status.last_status_change = Some(at);
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn machine() -> StatusMachine {
        StatusMachine::new(3, 2)
    }

    fn feed(m: &StatusMachine, status: &mut DeviceStatus, outcomes: &[bool]) -> Vec<DeviceStatusUpdate> {
        let t0 = Utc::now();
        outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, ok)| {
                let ts = t0 + Duration::seconds(5 * i as i64);
                let r = if *ok {
                    ProbeResult::success(status.device_id, ts, 10.0)
                } else {
                    ProbeResult::failure(status.device_id, ts, "unreachable")
                };
                m.apply(status, &r)
            })
            .collect()
    }

    #[test]
    fn test_three_failures_go_offline_once() {
        let m = machine();
        let mut s = DeviceStatus::new(Uuid::new_v4());

        let updates = feed(&m, &mut s, &[false, false]);
        assert!(updates.is_empty());
        assert_eq!(s.status, Status::Unknown);
        assert_eq!(s.consecutive_failures, 2);

        let updates = feed(&m, &mut s, &[false, false]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].previous_status, Status::Unknown);
        assert_eq!(updates[0].current_status, Status::Offline);
        assert_eq!(s.consecutive_failures, 4);
        assert_eq!(s.consecutive_successes, 0);
    }

    #[test]
    fn test_recovery_needs_two_successes() {
        let m = machine();
        let mut s = DeviceStatus::new(Uuid::new_v4());
        feed(&m, &mut s, &[false, false, false]);
        assert_eq!(s.status, Status::Offline);

        assert!(feed(&m, &mut s, &[true]).is_empty());
        assert_eq!(s.status, Status::Offline);
        assert_eq!(s.consecutive_failures, 0);

        let updates = feed(&m, &mut s, &[true]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].previous_status, Status::Offline);
        assert_eq!(updates[0].current_status, Status::Online);
        assert!(s.last_status_change.is_some());
    }

    #[test]
    fn test_flapping_below_threshold_is_silent() {
        let m = machine();
        let mut s = DeviceStatus::new(Uuid::new_v4());
        feed(&m, &mut s, &[true, true]);
        assert_eq!(s.status, Status::Online);

        let updates = feed(&m, &mut s, &[false, false, true, false, true, false, false, true]);
        assert!(updates.is_empty());
        assert_eq!(s.status, Status::Online);
    }

    #[test]
    fn test_stop_and_restart() {
        let m = machine();
        let mut s = DeviceStatus::new(Uuid::new_v4());
        feed(&m, &mut s, &[true, true, true]);

        let update = m.stop(&mut s, Utc::now()).unwrap();
        assert_eq!(update.current_status, Status::NotMonitored);
        assert_eq!(s.consecutive_successes, 0);
        assert!(m.stop(&mut s, Utc::now()).is_none());

        // Results arriving while stopped change nothing.
        assert!(feed(&m, &mut s, &[false, false, false]).is_empty());
        assert_eq!(s.status, Status::NotMonitored);
        assert_eq!(s.consecutive_failures, 0);

        let update = m.restart(&mut s, Utc::now()).unwrap();
        assert_eq!(update.previous_status, Status::NotMonitored);
        assert_eq!(s.status, Status::Unknown);
        assert!(s.last_response_time_ms.is_none());
    }
}
