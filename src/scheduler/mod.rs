//! Scheduler module for running probes and persisting their results.
//!
//! Every monitored target gets its own timer task. Timers only decide *when*
//! a probe is due; the probe itself runs on a shared, bounded worker pool and
//! its result is handed to the device pipeline through a slot reserved at
//! tick time, so per-device order is submission order.

mod registry;
mod retention;
mod rollup;

pub use registry::*;
pub use retention::*;
pub use rollup::*;

use crate::config::MonitorConfig;
use crate::db::{MonitoringTarget, ProbeResult, Store};
use crate::inventory::DeviceDirectory;
use crate::probe::{run_probe, Prober};

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// A probe submitted for a device, in tick order. The receiver yields once
/// the probe completes; it errors if the probe was cancelled.
#[derive(Debug)]
pub struct PendingProbe {
    pub generation: u64,
    pub result: oneshot::Receiver<ProbeResult>,
}

/// Drives per-target timers onto a shared worker pool.
pub struct Scheduler {
    prober: Arc<dyn Prober>,
    directory: Arc<dyn DeviceDirectory>,
    pool: Arc<Semaphore>,
    config: MonitorConfig,
    stop_chans: Arc<RwLock<HashMap<Uuid, broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(config: MonitorConfig, prober: Arc<dyn Prober>, directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            prober,
            directory,
            pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            config,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start (or restart) the timer for a target. Any previous timer for the
    /// same device is cancelled first.
    pub async fn arm(&self, target: MonitoringTarget, pipeline: mpsc::Sender<PendingProbe>) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(old) = stop_chans.remove(&target.device_id) {
            let _ = old.send(());
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_chans.insert(target.device_id, stop_tx.clone());
        drop(stop_chans);

        let period = Duration::from_secs(u64::from(target.interval_seconds.max(1)));
        let max_jitter_ms = (period.as_millis() / 10) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms));

        tracing::info!(
            "Scheduler: Arming {} every {}s (jitter {}ms, generation {})",
            target.device_id,
            target.interval_seconds,
            jitter.as_millis(),
            target.generation
        );

        let ctx = TickContext {
            device_id: target.device_id,
            fallback_address: target.address.clone(),
            generation: target.generation,
            timeout: self.config.probe_timeout_for(target.interval_seconds),
            prober: self.prober.clone(),
            directory: self.directory.clone(),
            pool: self.pool.clone(),
        };
        let stop_chans = self.stop_chans.clone();

        tokio::spawn(async move {
            run_target_loop(ctx, period, jitter, pipeline, stop_rx).await;

            // Only clean up our own entry; a re-arm may have replaced it.
            let mut chans = stop_chans.write().await;
            if chans.get(&target.device_id).is_some_and(|tx| tx.same_channel(&stop_tx)) {
                chans.remove(&target.device_id);
            }
        });
    }

    /// Cancel the timer and any queued or in-flight probes for a device.
    /// Returns without waiting for in-flight probes to finish.
    pub async fn disarm(&self, device_id: Uuid) -> bool {
        let mut stop_chans = self.stop_chans.write().await;

        match stop_chans.remove(&device_id) {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
                tracing::info!("Scheduler: Disarmed {}", device_id);
                true
            }
            None => false,
        }
    }

    pub async fn is_armed(&self, device_id: Uuid) -> bool {
        self.stop_chans.read().await.contains_key(&device_id)
    }

    pub async fn armed_count(&self) -> usize {
        self.stop_chans.read().await.len()
    }
}

/// Everything a tick needs, cloned once per armed target.
#[derive(Clone)]
struct TickContext {
    device_id: Uuid,
    fallback_address: String,
    generation: u64,
    timeout: Duration,
    prober: Arc<dyn Prober>,
    directory: Arc<dyn DeviceDirectory>,
    pool: Arc<Semaphore>,
}

impl TickContext {
    /// Current probe address from inventory, falling back to the address the
    /// target was armed with.
    async fn resolve_address(&self) -> String {
        match self.directory.resolve(self.device_id).await {
            Ok(Some(record)) => match record.probe_address() {
                Some(addr) => addr.to_string(),
                None => self.fallback_address.clone(),
            },
            Ok(None) => self.fallback_address.clone(),
            Err(e) => {
                tracing::debug!("Inventory lookup for {} failed, using {}: {}", self.device_id, self.fallback_address, e);
                self.fallback_address.clone()
            }
        }
    }
}

/// Run the timer loop for a single target.
async fn run_target_loop(
    ctx: TickContext,
    period: Duration,
    jitter: Duration,
    pipeline: mpsc::Sender<PendingProbe>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + jitter, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Set while a probe is waiting for a pool slot.
    let queued = Arc::new(AtomicBool::new(false));
    // Dropping the set aborts whatever is still queued or running.
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                break;
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            _ = interval.tick() => {
                if queued.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        "Saturated: worker pool busy, coalescing tick for {}",
                        ctx.device_id
                    );
                    continue;
                }

                let (result_tx, result_rx) = oneshot::channel();
                let pending = PendingProbe { generation: ctx.generation, result: result_rx };
                if pipeline.send(pending).await.is_err() {
                    tracing::debug!("Pipeline for {} closed, stopping timer", ctx.device_id);
                    break;
                }

                let ctx = ctx.clone();
                let queued = queued.clone();
                in_flight.spawn(async move {
                    let _permit = match ctx.pool.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    queued.store(false, Ordering::Release);

                    let address = ctx.resolve_address().await;
                    let result = run_probe(ctx.prober.as_ref(), ctx.device_id, &address, ctx.timeout).await;
                    let _ = result_tx.send(result);
                });
            }
        }
    }

    in_flight.shutdown().await;
}

/// Spawn the batch writer and return the sender feeding it.
pub fn spawn_result_writer(store: Arc<Store>) -> mpsc::Sender<ProbeResult> {
    let (tx, rx) = mpsc::channel(1000);
    tokio::spawn(run_batch_writer(rx, store));
    tx
}

/// Run the batch writer that accumulates and flushes probe results.
async fn run_batch_writer(mut rx: mpsc::Receiver<ProbeResult>, store: Arc<Store>) {
    let mut buffer: Vec<ProbeResult> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<ProbeResult>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_probe_results(buffer) {
        tracing::error!("Failed to flush {} probe results: {}", buffer.len(), e);
    }

    buffer.clear();
}
