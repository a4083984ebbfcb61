//! Registry of monitoring targets.
//!
//! Writers copy the map, modify the copy and swap it in; readers clone the
//! current `Arc` and iterate it without holding any lock, so a snapshot never
//! shows a half-applied update.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::db::MonitoringTarget;
use crate::error::{MonitorError, MonitorResult};

type TargetMap = HashMap<Uuid, MonitoringTarget>;

/// Result of [`TargetRegistry::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Already monitored with the same parameters; nothing to do.
    Unchanged(MonitoringTarget),
    /// New, resumed or edited target; the scheduler must (re-)arm it.
    Armed(MonitoringTarget),
}

impl StartOutcome {
    pub fn into_target(self) -> MonitoringTarget {
        match self {
            StartOutcome::Unchanged(t) | StartOutcome::Armed(t) => t,
        }
    }
}

/// Lock-free view of the registry at one point in time.
#[derive(Clone)]
pub struct TargetSnapshot {
    targets: Arc<TargetMap>,
}

impl TargetSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &MonitoringTarget> + '_ {
        self.targets.values()
    }

    pub fn monitored(&self) -> impl Iterator<Item = &MonitoringTarget> + '_ {
        self.iter().filter(|t| t.monitored)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub struct TargetRegistry {
    targets: RwLock<Arc<TargetMap>>,
    generation: AtomicU64,
    min_interval: u32,
    max_interval: u32,
}

impl TargetRegistry {
    pub fn new(min_interval: u32, max_interval: u32) -> Self {
        Self {
            targets: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            min_interval: min_interval.max(1),
            max_interval: max_interval.max(min_interval.max(1)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn current(&self) -> Arc<TargetMap> {
        match self.targets.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `f` to a private copy of the map and publish it.
    fn update<R>(&self, f: impl FnOnce(&mut TargetMap) -> R) -> R {
        let mut guard = match self.targets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    /// Reject empty addresses and intervals outside the configured bounds.
    pub fn validate(&self, address: &str, interval_seconds: i64) -> MonitorResult<(String, u32)> {
        let address = address.trim();
        if address.is_empty() {
            return Err(MonitorError::InvalidTarget("address must not be empty".to_string()));
        }
        if interval_seconds <= 0 {
            return Err(MonitorError::InvalidTarget(format!(
                "interval must be positive, got {}",
                interval_seconds
            )));
        }
        if interval_seconds < i64::from(self.min_interval) || interval_seconds > i64::from(self.max_interval) {
            return Err(MonitorError::InvalidTarget(format!(
                "interval {}s outside allowed range {}..={}s",
                interval_seconds, self.min_interval, self.max_interval
            )));
        }
        Ok((address.to_string(), interval_seconds as u32))
    }

    /// Start (or resume, or edit) monitoring of a device.
    pub fn start(
        &self,
        device_id: Uuid,
        address: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> MonitorResult<StartOutcome> {
        let (address, interval_seconds) = self.validate(address, interval_seconds)?;

        Ok(self.update(|map| match map.get_mut(&device_id) {
            Some(t) if t.monitored && t.address == address && t.interval_seconds == interval_seconds => {
                StartOutcome::Unchanged(t.clone())
            }
            Some(t) => {
                t.address = address;
                t.interval_seconds = interval_seconds;
                t.monitored = true;
                t.generation = self.next_generation();
                t.updated_at = now;
                StartOutcome::Armed(t.clone())
            }
            None => {
                let t = MonitoringTarget {
                    device_id,
                    address,
                    interval_seconds,
                    monitored: true,
                    generation: self.next_generation(),
                    created_at: now,
                    updated_at: now,
                };
                map.insert(device_id, t.clone());
                StartOutcome::Armed(t)
            }
        }))
    }

    /// Mark a target unmonitored. Fails if the device was never started.
    pub fn stop(&self, device_id: Uuid, now: DateTime<Utc>) -> MonitorResult<MonitoringTarget> {
        self.update(|map| match map.get_mut(&device_id) {
            Some(t) => {
                if t.monitored {
                    t.monitored = false;
                    t.generation = self.next_generation();
                    t.updated_at = now;
                }
                Ok(t.clone())
            }
            None => Err(MonitorError::device_not_found(device_id)),
        })
    }

    /// Forget a target entirely (device deleted from inventory).
    pub fn remove(&self, device_id: Uuid) -> Option<MonitoringTarget> {
        self.update(|map| map.remove(&device_id))
    }

    /// Put back an entry captured with [`get`](Self::get) before a change
    /// that could not be committed. `None` removes the entry.
    pub fn restore(&self, device_id: Uuid, previous: Option<MonitoringTarget>) {
        self.update(|map| match previous {
            Some(t) => {
                map.insert(device_id, t);
            }
            None => {
                map.remove(&device_id);
            }
        })
    }

    /// Seed the registry with persisted targets, assigning fresh generations.
    pub fn load(&self, targets: Vec<MonitoringTarget>) -> Vec<MonitoringTarget> {
        self.update(|map| {
            targets
                .into_iter()
                .map(|mut t| {
                    t.generation = self.next_generation();
                    map.insert(t.device_id, t.clone());
                    t
                })
                .collect()
        })
    }

    pub fn get(&self, device_id: Uuid) -> Option<MonitoringTarget> {
        self.current().get(&device_id).cloned()
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot { targets: self.current() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TargetRegistry {
        TargetRegistry::new(1, 3600)
    }

    #[test]
    fn test_start_validates() {
        let reg = registry();
        let id = Uuid::new_v4();
        let now = Utc::now();
        assert!(matches!(reg.start(id, "", 5, now), Err(MonitorError::InvalidTarget(_))));
        assert!(matches!(reg.start(id, "   ", 5, now), Err(MonitorError::InvalidTarget(_))));
        assert!(matches!(reg.start(id, "10.0.0.1", 0, now), Err(MonitorError::InvalidTarget(_))));
        assert!(matches!(reg.start(id, "10.0.0.1", -5, now), Err(MonitorError::InvalidTarget(_))));
        assert!(matches!(reg.start(id, "10.0.0.1", 7200, now), Err(MonitorError::InvalidTarget(_))));
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_start_is_idempotent() {
        let reg = registry();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let first = reg.start(id, "10.0.0.1", 5, now).unwrap();
        assert!(matches!(first, StartOutcome::Armed(_)));
        let second = reg.start(id, "10.0.0.1", 5, now).unwrap();
        assert!(matches!(second, StartOutcome::Unchanged(_)));
        assert_eq!(first.into_target().generation, second.into_target().generation);
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn test_edit_rearms_with_new_generation() {
        let reg = registry();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let first = reg.start(id, "10.0.0.1", 5, now).unwrap().into_target();
        let edited = reg.start(id, "10.0.0.2", 10, now).unwrap();
        let StartOutcome::Armed(edited) = edited else {
            panic!("edit should re-arm");
        };
        assert_eq!(edited.address, "10.0.0.2");
        assert_eq!(edited.interval_seconds, 10);
        assert!(edited.generation > first.generation);
        assert_eq!(reg.get(id).unwrap().generation, edited.generation);
    }

    #[test]
    fn test_stop() {
        let reg = registry();
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert!(matches!(reg.stop(id, now), Err(MonitorError::NotFound { .. })));

        let t = reg.start(id, "10.0.0.1", 5, now).unwrap().into_target();
        let stopped = reg.stop(id, now).unwrap();
        assert!(!stopped.monitored);
        assert_eq!(reg.get(id).unwrap().generation, t.generation + 1);
        // Stopping twice is harmless.
        assert!(!reg.stop(id, now).unwrap().monitored);
        assert_eq!(reg.snapshot().monitored().count(), 0);

        let resumed = reg.start(id, "10.0.0.1", 5, now).unwrap();
        assert!(matches!(resumed, StartOutcome::Armed(_)));
    }

    #[test]
    fn test_snapshot_is_stable_under_writes() {
        let reg = registry();
        let now = Utc::now();
        for i in 0..10 {
            reg.start(Uuid::new_v4(), &format!("10.0.0.{}", i), 5, now).unwrap();
        }

        let snap = reg.snapshot();
        let mut seen = 0;
        for t in snap.iter() {
            reg.stop(t.device_id, now).unwrap();
            reg.start(Uuid::new_v4(), "10.9.9.9", 5, now).unwrap();
            seen += 1;
        }
        assert_eq!(seen, 10);
        assert!(snap.iter().all(|t| t.monitored));
        assert_eq!(reg.snapshot().len(), 20);
    }

    #[test]
    fn test_restore_undoes_start() {
        let reg = registry();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let before = reg.get(id);
        reg.start(id, "10.0.0.1", 5, now).unwrap();
        reg.restore(id, before);
        assert!(reg.get(id).is_none());

        let armed = reg.start(id, "10.0.0.1", 5, now).unwrap().into_target();
        let before = reg.get(id);
        reg.start(id, "10.0.0.2", 30, now).unwrap();
        reg.restore(id, before);
        assert_eq!(reg.get(id), Some(armed.clone()));

        // A retry after the rollback is a real edit again, not a no-op.
        assert!(matches!(reg.start(id, "10.0.0.2", 30, now).unwrap(), StartOutcome::Armed(_)));
    }
}
