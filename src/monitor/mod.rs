//! Monitoring engine.
//!
//! [`MonitoringService`] is the entry point for collaborators: it wires the
//! target registry, scheduler, device pipelines, alert engine and statistics
//! aggregator together and exposes the operations the HTTP layer calls.

mod alerts;
mod device;
mod events;
mod stats;
mod status;

pub use alerts::*;
pub use device::*;
pub use events::*;
pub use stats::*;
pub use status::*;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::db::{
    Alert, AlertFilter, AlertStatistics, DeviceRecord, DeviceStatus, DeviceStatusUpdate, MonitoringTarget, ProbeResult, Status,
    Store,
};
use crate::error::{MonitorError, MonitorResult};
use crate::inventory::DeviceDirectory;
use crate::probe::Prober;
use crate::scheduler::{
    spawn_result_writer, RetentionManager, RetentionPolicy, RollupManager, Scheduler, StartOutcome, TargetRegistry,
};

/// Outcome of a bulk start/stop. Devices are handled one at a time; a failure
/// on one does not undo the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkResult {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

pub struct MonitoringService {
    config: MonitorConfig,
    store: Arc<Store>,
    directory: Arc<dyn DeviceDirectory>,
    registry: TargetRegistry,
    scheduler: Scheduler,
    alerts: Arc<AlertEngine>,
    stats: StatisticsAggregator,
    events: EventBus,
    context: Arc<PipelineContext>,
    pipelines: Mutex<HashMap<Uuid, Arc<DeviceHandle>>>,
    /// Serializes start/stop so each target has a single writer.
    admin: tokio::sync::Mutex<()>,
}

impl MonitoringService {
    /// Build the engine. Must be called inside a tokio runtime; the result
    /// writer task is spawned here.
    pub fn new(
        config: MonitorConfig,
        store: Arc<Store>,
        directory: Arc<dyn DeviceDirectory>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let events = EventBus::new(1024);
        let alerts = Arc::new(AlertEngine::new(store.clone(), &config));
        let context = Arc::new(PipelineContext {
            machine: StatusMachine::new(config.failure_threshold, config.recovery_threshold),
            alerts: alerts.clone(),
            events: events.clone(),
            results: spawn_result_writer(store.clone()),
            store: store.clone(),
        });

        Self {
            registry: TargetRegistry::new(config.min_interval_seconds, config.max_interval_seconds),
            scheduler: Scheduler::new(config.clone(), prober, directory.clone()),
            stats: StatisticsAggregator::new(store.clone(), config.raw_retention_days),
            config,
            store,
            directory,
            alerts,
            events,
            context,
            pipelines: Mutex::new(HashMap::new()),
            admin: tokio::sync::Mutex::new(()),
        }
    }

    /// Resume persisted targets and start the rollup and retention tasks.
    pub async fn start(&self) -> MonitorResult<()> {
        let resumed = self.resume().await?;
        tracing::info!("Monitoring engine started with {} active targets", resumed);

        RollupManager::new(self.store.clone()).start();
        RetentionManager::new(self.store.clone(), RetentionPolicy::from(&self.config)).start();
        Ok(())
    }

    /// Load targets from the store and re-arm the monitored ones.
    pub async fn resume(&self) -> MonitorResult<usize> {
        let _guard = self.admin.lock().await;
        let targets = self.registry.load(self.store.get_targets()?);

        let mut armed = 0;
        for target in targets.into_iter().filter(|t| t.monitored) {
            match self.arm(target.clone()).await {
                Ok(()) => armed += 1,
                Err(e) => {
                    tracing::error!("Failed to resume monitoring of {}: {}", target.device_id, e);
                    self.abandon(target.device_id).await;
                }
            }
        }
        Ok(armed)
    }

    /// Start monitoring a device at its inventory address. Without an
    /// interval, an existing target keeps its interval and a new one gets the
    /// configured default.
    pub async fn start_monitoring(&self, device_id: Uuid, interval_seconds: Option<i64>) -> MonitorResult<MonitoringTarget> {
        let _guard = self.admin.lock().await;

        let record = self
            .directory
            .resolve(device_id)
            .await?
            .ok_or_else(|| MonitorError::device_not_found(device_id))?;
        let address = record.probe_address().ok_or_else(|| {
            MonitorError::InvalidTarget(format!("device {} has neither an IP address nor a hostname", device_id))
        })?;

        let interval = interval_seconds.unwrap_or_else(|| {
            let existing = self.registry.get(device_id).map(|t| t.interval_seconds);
            i64::from(existing.unwrap_or(self.config.default_interval_seconds))
        });

        let previous = self.registry.get(device_id);
        let outcome = self.registry.start(device_id, address, interval, Utc::now())?;
        match &outcome {
            StartOutcome::Unchanged(_) => {
                tracing::debug!("Monitoring of {} already active with the same parameters", device_id);
            }
            StartOutcome::Armed(target) => {
                // Nothing is armed until the target is persisted; a failed
                // write leaves the previous entry and its timer untouched.
                if let Err(e) = self.store.upsert_target(target) {
                    self.registry.restore(device_id, previous);
                    return Err(e.into());
                }
                if let Err(e) = self.arm(target.clone()).await {
                    self.abandon(device_id).await;
                    return Err(e);
                }
                tracing::info!("Started monitoring {} at {} every {}s", device_id, target.address, target.interval_seconds);
            }
        }
        Ok(outcome.into_target())
    }

    /// Stop monitoring a device. Queued and in-flight probes are cancelled
    /// and the device reports NOT_MONITORED.
    pub async fn stop_monitoring(&self, device_id: Uuid) -> MonitorResult<()> {
        let _guard = self.admin.lock().await;

        let previous = self.registry.get(device_id);
        let target = self.registry.stop(device_id, Utc::now())?;
        if let Err(e) = self.store.upsert_target(&target) {
            self.registry.restore(device_id, previous);
            return Err(e.into());
        }
        self.scheduler.disarm(device_id).await;

        if let Some(pipeline) = self.pipeline(device_id) {
            if let Err(e) = pipeline.stop().await {
                // A dead pipeline reports nothing; drop it so a later start
                // spawns a fresh one.
                tracing::error!("Pipeline for {} did not acknowledge stop: {}", device_id, e);
                self.drop_pipeline(device_id);
            }
        }
        tracing::info!("Stopped monitoring {}", device_id);
        Ok(())
    }

    /// Start every inventory device that has an address.
    pub async fn start_all(&self) -> MonitorResult<BulkResult> {
        let devices = self.directory.list().await?;
        let mut result = BulkResult { total: devices.len(), ..BulkResult::default() };

        for device in devices {
            match self.start_monitoring(device.device_id, None).await {
                Ok(_) => result.successful += 1,
                Err(e) => {
                    tracing::warn!("Could not start monitoring {}: {}", device.device_id, e);
                    result.failed += 1;
                }
            }
        }
        Ok(result)
    }

    /// Stop every monitored target.
    pub async fn stop_all(&self) -> BulkResult {
        let snapshot = self.registry.snapshot();
        let ids: Vec<Uuid> = snapshot.monitored().map(|t| t.device_id).collect();
        let mut result = BulkResult { total: ids.len(), ..BulkResult::default() };

        for id in ids {
            match self.stop_monitoring(id).await {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    tracing::warn!("Could not stop monitoring {}: {}", id, e);
                    result.failed += 1;
                }
            }
        }
        result
    }

    pub async fn current_status(&self, device_id: Uuid) -> MonitorResult<DeviceStatus> {
        Ok(self.device_snapshot(device_id).await?.status)
    }

    /// Status plus live counters. Devices known to inventory but never
    /// monitored report NOT_MONITORED.
    pub async fn device_snapshot(&self, device_id: Uuid) -> MonitorResult<DeviceSnapshot> {
        if let Some(pipeline) = self.pipeline(device_id) {
            return Ok(pipeline.snapshot());
        }
        self.ensure_known(device_id).await?;

        let mut status = DeviceStatus::new(device_id);
        status.status = Status::NotMonitored;
        Ok(DeviceSnapshot { status, counters: LiveCounters::default() })
    }

    pub async fn statistics(&self, device_id: Uuid, range: TimeRange) -> MonitorResult<WindowStatistics> {
        self.ensure_known(device_id).await?;
        self.stats.query(device_id, range)
    }

    /// Most recent stored results, newest first.
    pub async fn recent_results(&self, device_id: Uuid, limit: i64) -> MonitorResult<Vec<ProbeResult>> {
        self.ensure_known(device_id).await?;
        Ok(self.store.recent_probe_results(device_id, limit.clamp(1, 1000))?)
    }

    /// Recorded status transitions, oldest first.
    pub async fn status_history(&self, device_id: Uuid) -> MonitorResult<Vec<DeviceStatusUpdate>> {
        self.ensure_known(device_id).await?;
        Ok(self.store.get_status_changes(device_id)?)
    }

    /// Number of targets with a live timer.
    pub async fn armed_count(&self) -> usize {
        self.scheduler.armed_count().await
    }

    pub fn list_targets(&self) -> Vec<MonitoringTarget> {
        let mut targets: Vec<MonitoringTarget> = self.registry.snapshot().iter().cloned().collect();
        targets.sort_by_key(|t| t.created_at);
        targets
    }

    // --- Alerts ---

    pub fn acknowledge_alert(&self, id: Uuid, actor: &str) -> MonitorResult<Alert> {
        let (alert, changed) = self.alerts.acknowledge(id, actor, Utc::now())?;
        if changed {
            self.events.publish(MonitorEvent::AlertUpdated(alert.clone()));
        }
        Ok(alert)
    }

    pub fn resolve_alert(&self, id: Uuid) -> MonitorResult<Alert> {
        let (alert, changed) = self.alerts.resolve(id, Utc::now())?;
        if changed {
            self.events.publish(MonitorEvent::AlertUpdated(alert.clone()));
        }
        Ok(alert)
    }

    pub fn delete_alert(&self, id: Uuid) -> MonitorResult<()> {
        self.alerts.delete(id)
    }

    pub fn create_custom_alert(&self, device_id: Uuid, message: &str) -> MonitorResult<Alert> {
        let alert = self.alerts.create_custom(device_id, message, Utc::now())?;
        self.events.publish(MonitorEvent::AlertCreated(alert.clone()));
        Ok(alert)
    }

    pub fn list_alerts(&self, filter: &AlertFilter) -> MonitorResult<Vec<Alert>> {
        self.alerts.list(filter)
    }

    pub fn alert_statistics(&self) -> MonitorResult<AlertStatistics> {
        self.alerts.statistics()
    }

    // --- Inventory sync ---

    /// Device created or edited in inventory. A monitored device picks up a
    /// new address on its next probe.
    pub fn upsert_device(&self, record: &DeviceRecord) -> MonitorResult<()> {
        self.store.upsert_device(record)?;
        tracing::debug!("Inventory record for {} updated", record.device_id);
        Ok(())
    }

    /// Device deleted from inventory: stop it and drop all of its history.
    pub async fn remove_device(&self, device_id: Uuid) -> MonitorResult<()> {
        if self.registry.get(device_id).is_some_and(|t| t.monitored) {
            self.stop_monitoring(device_id).await?;
        }

        let _guard = self.admin.lock().await;
        self.registry.remove(device_id);
        self.drop_pipeline(device_id);
        self.store.delete_device_data(device_id)?;
        tracing::info!("Removed device {} and its monitoring data", device_id);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// `NotFound` unless the device is a target or known to inventory.
    async fn ensure_known(&self, device_id: Uuid) -> MonitorResult<()> {
        if self.registry.get(device_id).is_some() || self.directory.resolve(device_id).await?.is_some() {
            Ok(())
        } else {
            Err(MonitorError::device_not_found(device_id))
        }
    }

    /// Undo a start whose pipeline could not be armed: cancel any timer,
    /// discard the pipeline and record the target as not monitored.
    async fn abandon(&self, device_id: Uuid) {
        self.scheduler.disarm(device_id).await;
        self.drop_pipeline(device_id);
        if let Ok(target) = self.registry.stop(device_id, Utc::now()) {
            if let Err(e) = self.store.upsert_target(&target) {
                tracing::error!("Failed to persist stopped target {}: {}", device_id, e);
            }
        }
    }

    async fn arm(&self, target: MonitoringTarget) -> MonitorResult<()> {
        let pipeline = self.pipeline_or_spawn(target.device_id);
        pipeline.start(target.generation).await?;
        self.scheduler.arm(target, pipeline.probe_sender()).await;
        Ok(())
    }

    fn pipeline(&self, device_id: Uuid) -> Option<Arc<DeviceHandle>> {
        match self.pipelines.lock() {
            Ok(pipelines) => pipelines.get(&device_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&device_id).cloned(),
        }
    }

    fn drop_pipeline(&self, device_id: Uuid) {
        match self.pipelines.lock() {
            Ok(mut pipelines) => pipelines.remove(&device_id),
            Err(poisoned) => poisoned.into_inner().remove(&device_id),
        };
    }

    fn pipeline_or_spawn(&self, device_id: Uuid) -> Arc<DeviceHandle> {
        let mut pipelines = match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pipelines
            .entry(device_id)
            .or_insert_with(|| Arc::new(DeviceHandle::spawn(device_id, self.context.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertType;
    use crate::inventory::testing::MemoryDirectory;
    use crate::probe::testing::{ScriptedProber, Step};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Fixture {
        db_file: NamedTempFile,
        prober: Arc<ScriptedProber>,
        directory: Arc<MemoryDirectory>,
        service: MonitoringService,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let prober = Arc::new(ScriptedProber::new());
        let directory = Arc::new(MemoryDirectory::new());
        let service = MonitoringService::new(config, store, directory.clone(), prober.clone());
        Fixture { db_file: tmp, prober, directory, service }
    }

    fn alerts_of(f: &Fixture, id: Uuid) -> Vec<Alert> {
        f.service.list_alerts(&AlertFilter { device_id: Some(id), unresolved_only: false }).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_and_recovery_episode() {
        let f = fixture(MonitorConfig::default());
        let d1 = Uuid::new_v4();
        f.directory.add(d1, "10.0.0.1");
        f.prober.script(
            "10.0.0.1",
            vec![Step::Down("unreachable"), Step::Down("unreachable"), Step::Down("unreachable"), Step::Up(10.0)],
        );

        f.service.start_monitoring(d1, Some(5)).await.unwrap();

        // Ticks near t=0, 5, 10: three failures.
        tokio::time::sleep(Duration::from_millis(12_000)).await;
        assert_eq!(f.service.current_status(d1).await.unwrap().status, Status::Offline);
        let alerts = alerts_of(&f, d1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DeviceDown);

        // Ticks near t=15, 20: two successes.
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        let status = f.service.current_status(d1).await.unwrap();
        assert_eq!(status.status, Status::Online);
        assert_eq!(status.consecutive_successes, 2);

        let alerts = alerts_of(&f, d1);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.alert_type == AlertType::DeviceRecovered));
        assert!(alerts.iter().all(|a| a.alert_type != AlertType::DeviceDown || a.resolved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_keeps_counters() {
        let f = fixture(MonitorConfig::default());
        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.0.2");
        f.prober.script("10.0.0.2", vec![Step::Down("unreachable")]);

        let first = f.service.start_monitoring(id, Some(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert_eq!(f.service.current_status(id).await.unwrap().consecutive_failures, 2);

        let second = f.service.start_monitoring(id, Some(5)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.service.list_targets().len(), 1);
        assert_eq!(f.service.current_status(id).await.unwrap().consecutive_failures, 2);

        // Without an interval the existing one is kept.
        let third = f.service.start_monitoring(id, None).await.unwrap();
        assert_eq!(third.interval_seconds, 5);
        assert_eq!(third.generation, first.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_late_result() {
        let config = MonitorConfig { recovery_threshold: 1, ..MonitorConfig::default() };
        let f = fixture(config);
        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.0.3");
        f.prober.script("10.0.0.3", vec![Step::Slow(Duration::from_secs(3), 200.0)]);
        let mut events = f.service.subscribe();

        f.service.start_monitoring(id, Some(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(f.prober.in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);

        f.service.stop_monitoring(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let status = f.service.current_status(id).await.unwrap();
        assert_eq!(status.status, Status::NotMonitored);
        assert_eq!(status.consecutive_successes, 0);
        assert!(alerts_of(&f, id).is_empty());
        assert!(!f.service.list_targets()[0].monitored);

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, MonitorEvent::ProbeResult(_) | MonitorEvent::AlertCreated(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probes_raise_one_latency_alert() {
        let f = fixture(MonitorConfig::default());
        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.0.4");
        f.prober.script("10.0.0.4", vec![Step::Up(150.0)]);

        f.service.start_monitoring(id, Some(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(11_000)).await;

        let alerts = alerts_of(&f, id);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighResponseTime);
        assert!(!alerts[0].resolved);

        // Latency back to normal for three probes auto-resolves it.
        f.prober.script("10.0.0.4", vec![Step::Up(15.0)]);
        tokio::time::sleep(Duration::from_millis(15_000)).await;
        let alerts = alerts_of(&f, id);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_and_unknown_devices() {
        let f = fixture(MonitorConfig::default());
        let unknown = Uuid::new_v4();
        assert!(matches!(f.service.start_monitoring(unknown, None).await, Err(MonitorError::NotFound { .. })));
        assert!(matches!(f.service.stop_monitoring(unknown).await, Err(MonitorError::NotFound { .. })));
        assert!(matches!(f.service.current_status(unknown).await, Err(MonitorError::NotFound { .. })));

        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.0.5");
        assert!(matches!(f.service.start_monitoring(id, Some(0)).await, Err(MonitorError::InvalidTarget(_))));
        assert!(f.service.list_targets().is_empty());
        assert_eq!(f.service.current_status(id).await.unwrap().status, Status::NotMonitored);

        assert!(matches!(
            f.service.statistics(unknown, TimeRange::LastHour).await,
            Err(MonitorError::NotFound { .. })
        ));
        assert!(matches!(f.service.recent_results(unknown, 10).await, Err(MonitorError::NotFound { .. })));
        assert!(matches!(f.service.status_history(unknown).await, Err(MonitorError::NotFound { .. })));
        assert_eq!(f.service.statistics(id, TimeRange::LastHour).await.unwrap().total_pings, 0);
        assert!(f.service.status_history(id).await.unwrap().is_empty());
    }

    /// Rename a table behind the store's back so its next write fails.
    fn rename_table(f: &Fixture, from: &str, to: &str) {
        let conn = rusqlite::Connection::open(f.db_file.path()).unwrap();
        conn.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", from, to)).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_target_write_keeps_state_consistent() {
        let f = fixture(MonitorConfig::default());
        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.4.1");
        f.prober.script("10.0.4.1", vec![Step::Up(5.0)]);

        rename_table(&f, "targets", "targets_offline");
        assert!(matches!(f.service.start_monitoring(id, Some(5)).await, Err(MonitorError::Store(_))));
        assert!(f.service.list_targets().is_empty());
        assert_eq!(f.service.armed_count().await, 0);
        assert_eq!(f.service.current_status(id).await.unwrap().status, Status::NotMonitored);

        // The retry must really arm, not be treated as already running.
        rename_table(&f, "targets_offline", "targets");
        f.service.start_monitoring(id, Some(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(12_000)).await;
        assert_eq!(f.service.armed_count().await, 1);
        assert_eq!(f.service.current_status(id).await.unwrap().status, Status::Online);

        // A failed edit keeps the running parameters.
        rename_table(&f, "targets", "targets_offline");
        assert!(f.service.start_monitoring(id, Some(30)).await.is_err());
        assert_eq!(f.service.list_targets()[0].interval_seconds, 5);

        // A failed stop leaves the device monitored and probed.
        assert!(matches!(f.service.stop_monitoring(id).await, Err(MonitorError::Store(_))));
        assert!(f.service.list_targets()[0].monitored);
        assert_eq!(f.service.armed_count().await, 1);
        let calls = f.prober.calls.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert!(f.prober.calls.load(std::sync::atomic::Ordering::SeqCst) > calls);
        assert_eq!(f.service.current_status(id).await.unwrap().status, Status::Online);

        rename_table(&f, "targets_offline", "targets");
        f.service.stop_monitoring(id).await.unwrap();
        assert!(!f.service.list_targets()[0].monitored);
        assert_eq!(f.service.armed_count().await, 0);
        assert_eq!(f.service.current_status(id).await.unwrap().status, Status::NotMonitored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_start_and_stop() {
        let f = fixture(MonitorConfig::default());
        for i in 0..3 {
            let id = Uuid::new_v4();
            f.directory.add(id, &format!("10.0.1.{}", i));
        }

        let started = f.service.start_all().await.unwrap();
        assert_eq!(started, BulkResult { successful: 3, failed: 0, total: 3 });

        assert_eq!(f.service.armed_count().await, 3);
        let stopped = f.service.stop_all().await;
        assert_eq!(stopped, BulkResult { successful: 3, failed: 0, total: 3 });
        for target in f.service.list_targets() {
            assert!(!target.monitored);
            let status = f.service.current_status(target.device_id).await.unwrap();
            assert_eq!(status.status, Status::NotMonitored);

            let history = f.service.status_history(target.device_id).await.unwrap();
            let last = history.last().unwrap();
            assert_eq!(last.current_status, Status::NotMonitored);
        }
        assert_eq!(f.service.armed_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let directory = Arc::new(MemoryDirectory::new());
        let prober = Arc::new(ScriptedProber::new());
        let id = Uuid::new_v4();
        directory.add(id, "10.0.2.1");
        prober.script("10.0.2.1", vec![Step::Up(5.0)]);

        let first = MonitoringService::new(MonitorConfig::default(), store.clone(), directory.clone(), prober.clone());
        first.start_monitoring(id, Some(10)).await.unwrap();
        first.stop_all().await;
        first.start_monitoring(id, Some(10)).await.unwrap();
        drop(first);

        let second = MonitoringService::new(MonitorConfig::default(), store, directory, prober.clone());
        assert_eq!(second.resume().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(12_000)).await;
        assert_eq!(second.current_status(id).await.unwrap().status, Status::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_device_drops_history() {
        let f = fixture(MonitorConfig::default());
        let id = Uuid::new_v4();
        f.directory.add(id, "10.0.3.1");
        f.prober.script("10.0.3.1", vec![Step::Up(5.0)]);

        f.service.start_monitoring(id, Some(1)).await.unwrap();
        f.service.create_custom_alert(id, "rack moved").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        f.service.remove_device(id).await.unwrap();
        assert!(f.service.list_targets().is_empty());
        assert!(alerts_of(&f, id).is_empty());
        assert!(f.service.recent_results(id, 10).await.unwrap().is_empty());
    }
}
