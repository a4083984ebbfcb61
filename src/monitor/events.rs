//! Push feed for real-time subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::{Alert, DeviceStatusUpdate, ProbeResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum MonitorEvent {
    ProbeResult(ProbeResult),
    StatusChanged(DeviceStatusUpdate),
    AlertCreated(Alert),
    AlertUpdated(Alert),
}

impl MonitorEvent {
    /// Event name used on the SSE stream.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::ProbeResult(_) => "probeResult",
            MonitorEvent::StatusChanged(_) => "statusChanged",
            MonitorEvent::AlertCreated(_) => "alertCreated",
            MonitorEvent::AlertUpdated(_) => "alertUpdated",
        }
    }
}

/// Fan-out of [`MonitorEvent`]s. Slow subscribers lag and lose events rather
/// than slowing the pipelines down.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: MonitorEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}
