//! Per-device pipeline.
//!
//! Each device gets one task that owns its [`DeviceStatus`] and alert
//! tracker. Probe slots arrive in tick order and are drained strictly in
//! that order, so the state machine, alert rules and result writer all see a
//! device's results in submission order without any shared lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::alerts::{AlertChange, AlertEngine, AlertTracker};
use super::events::{EventBus, MonitorEvent};
use super::status::StatusMachine;
use crate::db::{DeviceStatus, DeviceStatusUpdate, ProbeResult, Status, Store};
use crate::error::{MonitorError, MonitorResult};
use crate::scheduler::PendingProbe;

/// Probe counts since monitoring was last started.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveCounters {
    pub probes: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_result_at: Option<DateTime<Utc>>,
}

impl LiveCounters {
    fn record(&mut self, result: &ProbeResult) {
        self.probes += 1;
        if result.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_result_at = Some(result.timestamp);
    }
}

/// What readers see of a device pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub status: DeviceStatus,
    pub counters: LiveCounters,
}

/// Collaborators shared by every device pipeline.
pub struct PipelineContext {
    pub machine: StatusMachine,
    pub alerts: Arc<AlertEngine>,
    pub events: EventBus,
    pub results: mpsc::Sender<ProbeResult>,
    pub store: Arc<Store>,
}

enum Control {
    Start { generation: u64, ack: oneshot::Sender<()> },
    Stop { ack: oneshot::Sender<()> },
}

/// Owner-side handle to a running device pipeline.
pub struct DeviceHandle {
    device_id: Uuid,
    control: mpsc::Sender<Control>,
    probes: mpsc::Sender<PendingProbe>,
    snapshot: watch::Receiver<DeviceSnapshot>,
}

impl DeviceHandle {
    /// Spawn the pipeline task. It starts out NOT_MONITORED.
    pub fn spawn(device_id: Uuid, ctx: Arc<PipelineContext>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (probe_tx, probe_rx) = mpsc::channel(64);

        let mut status = DeviceStatus::new(device_id);
        status.status = Status::NotMonitored;
        let initial = DeviceSnapshot { status: status.clone(), counters: LiveCounters::default() };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let actor = DeviceActor {
            device_id,
            ctx,
            status,
            tracker: AlertTracker::default(),
            counters: LiveCounters::default(),
            generation: None,
            snapshot_tx,
        };
        tokio::spawn(actor.run(control_rx, probe_rx));

        Self {
            device_id,
            control: control_tx,
            probes: probe_tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn probe_sender(&self) -> mpsc::Sender<PendingProbe> {
        self.probes.clone()
    }

    /// Accept results of `generation` from now on. Leaves NOT_MONITORED if needed.
    pub async fn start(&self, generation: u64) -> MonitorResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(Control::Start { generation, ack }).await?;
        done.await.map_err(|_| MonitorError::PipelineClosed(self.device_id))
    }

    /// Drop queued results and move to NOT_MONITORED.
    pub async fn stop(&self) -> MonitorResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(Control::Stop { ack }).await?;
        done.await.map_err(|_| MonitorError::PipelineClosed(self.device_id))
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    async fn send(&self, msg: Control) -> MonitorResult<()> {
        self.control
            .send(msg)
            .await
            .map_err(|_| MonitorError::PipelineClosed(self.device_id))
    }
}

struct DeviceActor {
    device_id: Uuid,
    ctx: Arc<PipelineContext>,
    status: DeviceStatus,
    tracker: AlertTracker,
    counters: LiveCounters,
    /// `None` while stopped.
    generation: Option<u64>,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
}

impl DeviceActor {
    async fn run(mut self, mut control_rx: mpsc::Receiver<Control>, mut probe_rx: mpsc::Receiver<PendingProbe>) {
        let mut queue: VecDeque<PendingProbe> = VecDeque::new();
        let mut current: Option<PendingProbe> = None;

        loop {
            if current.is_none() {
                current = queue.pop_front();
            }

            tokio::select! {
                biased;
                msg = control_rx.recv() => match msg {
                    Some(Control::Start { generation, ack }) => {
                        isolate(self.device_id, "start", || self.on_start(generation));
                        let _ = ack.send(());
                    }
                    Some(Control::Stop { ack }) => {
                        current = None;
                        queue.clear();
                        isolate(self.device_id, "stop", || self.on_stop());
                        let _ = ack.send(());
                    }
                    None => break,
                },
                pending = probe_rx.recv() => match pending {
                    Some(p) => queue.push_back(p),
                    None => break,
                },
                outcome = next_result(&mut current), if current.is_some() => {
                    let generation = current.take().map(|p| p.generation);
                    match outcome {
                        Ok(result) => self.on_result(generation, result).await,
                        Err(_) => tracing::debug!("Probe for {} cancelled", self.device_id),
                    }
                }
            }
        }

        tracing::debug!("Pipeline for {} exited", self.device_id);
    }

    async fn on_result(&mut self, generation: Option<u64>, result: ProbeResult) {
        if self.generation.is_none() || generation != self.generation {
            tracing::warn!(
                "Discarding late result for {} (generation {:?}, current {:?})",
                self.device_id,
                generation,
                self.generation
            );
            return;
        }

        isolate(self.device_id, "probe result", || self.apply(&result));

        if self.ctx.results.send(result).await.is_err() {
            tracing::error!("Result writer closed, dropping result for {}", self.device_id);
        }
    }

    fn apply(&mut self, result: &ProbeResult) {
        self.counters.record(result);
        self.ctx.events.publish(MonitorEvent::ProbeResult(result.clone()));

        if let Some(update) = self.ctx.machine.apply(&mut self.status, result) {
            self.record_transition(update);
        }

        match self.ctx.alerts.on_probe(&mut self.tracker, result) {
            Ok(changes) => self.publish_alerts(changes),
            Err(e) => tracing::error!("Alert evaluation failed for {}: {}", self.device_id, e),
        }

        self.publish_snapshot();
    }

    fn on_start(&mut self, generation: u64) {
        self.generation = Some(generation);
        let update = self.ctx.machine.restart(&mut self.status, Utc::now());
        if update.is_some() {
            self.tracker = AlertTracker::default();
            self.counters = LiveCounters::default();
        }
        self.publish_snapshot();
        if let Some(update) = update {
            self.record_transition(update);
        }
    }

    fn on_stop(&mut self) {
        self.generation = None;
        let update = self.ctx.machine.stop(&mut self.status, Utc::now());
        self.tracker = AlertTracker::default();
        self.counters = LiveCounters::default();
        self.publish_snapshot();
        if let Some(update) = update {
            self.record_transition(update);
        }
    }

    fn record_transition(&mut self, update: DeviceStatusUpdate) {
        tracing::info!(
            "Device {} status {} -> {}",
            update.device_id,
            update.previous_status,
            update.current_status
        );

        if let Err(e) = self.ctx.store.add_status_change(&update) {
            tracing::error!("Failed to record status change for {}: {}", self.device_id, e);
        }
        self.ctx.events.publish(MonitorEvent::StatusChanged(update.clone()));

        match self.ctx.alerts.on_status_change(&update) {
            Ok(changes) => self.publish_alerts(changes),
            Err(e) => tracing::error!("Alert evaluation failed for {}: {}", self.device_id, e),
        }
    }

    fn publish_alerts(&self, changes: Vec<AlertChange>) {
        for change in changes {
            let event = match change {
                AlertChange::Created(alert) => MonitorEvent::AlertCreated(alert),
                AlertChange::Updated(alert) => MonitorEvent::AlertUpdated(alert),
            };
            self.ctx.events.publish(event);
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(DeviceSnapshot {
            status: self.status.clone(),
            counters: self.counters.clone(),
        });
    }
}

/// Wait for the head slot. Only polled while a slot is present.
async fn next_result(current: &mut Option<PendingProbe>) -> Result<ProbeResult, RecvError> {
    match current {
        Some(p) => (&mut p.result).await,
        None => std::future::pending().await,
    }
}

/// Run one actor step, containing any panic so the pipeline keeps serving
/// its control and probe channels. Returns false if the step panicked.
fn isolate(device_id: Uuid, stage: &str, step: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(step)) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!("Pipeline for {} panicked while handling {}", device_id, stage);
            false
        }
    }
}
