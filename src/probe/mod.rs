//! Probe module for reachability checks.
//!
//! Supports ICMP echo (with a `ping` command fallback) and TCP connect probes.
//! Whatever goes wrong inside a probe, callers of [`run_probe`] only ever see
//! a [`ProbeResult`]: failures are data, not errors.

mod ping;
mod tcp;

pub use ping::*;
pub use tcp::*;

use crate::config::ProbeKind;
use crate::db::ProbeResult;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("DNS resolution failed: {0}")]
    Resolve(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// A single network reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Check `address` once. Returns the round trip in milliseconds.
    async fn check(&self, address: &str, timeout: Duration) -> Result<f64, ProbeError>;

    /// Short name for logs (e.g. "icmp", "tcp").
    fn name(&self) -> &str;
}

/// Build the prober selected by configuration.
pub fn prober_for(kind: ProbeKind) -> Arc<dyn Prober> {
    match kind {
        ProbeKind::Icmp => Arc::new(IcmpProber::new()),
        ProbeKind::Tcp { default_port } => Arc::new(TcpProber::new(default_port)),
    }
}

/// Run one probe for a device with a client-side timeout.
///
/// Never fails: DNS errors, unreachable hosts and timeouts all come back as
/// `success = false` with a readable `error_message`.
pub async fn run_probe(prober: &dyn Prober, device_id: Uuid, address: &str, timeout: Duration) -> ProbeResult {
    let timestamp = Utc::now();
    let started = Instant::now();

    let outcome = match tokio::time::timeout(timeout, prober.check(address, timeout)).await {
        Ok(Ok(rtt_ms)) if started.elapsed() < timeout => Ok(rtt_ms),
        Ok(Ok(_)) => Err(ProbeError::Timeout(timeout)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    };

    match outcome {
        Ok(rtt_ms) => ProbeResult::success(device_id, timestamp, rtt_ms),
        Err(e) => {
            tracing::debug!("{} probe of {} failed: {}", prober.name(), address, e);
            ProbeResult::failure(device_id, timestamp, e.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable prober for pipeline tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Step {
        Up(f64),
        Down(&'static str),
        /// Sleep before answering with the inner step's outcome.
        Slow(Duration, f64),
    }

    /// Replays scripted outcomes per address; repeats the last step when exhausted.
    #[derive(Default)]
    pub struct ScriptedProber {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl ScriptedProber {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, address: &str, steps: Vec<Step>) {
            self.scripts.lock().unwrap().insert(address.to_string(), steps.into());
        }

        fn next_step(&self, address: &str) -> Step {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(address) {
                Some(q) if q.len() > 1 => q.pop_front().unwrap(),
                Some(q) => q.front().cloned().unwrap_or(Step::Down("no script")),
                None => Step::Down("no script"),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn check(&self, address: &str, _timeout: Duration) -> Result<f64, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let step = self.next_step(address);
            let out = match step {
                Step::Up(ms) => Ok(ms),
                Step::Down(msg) => Err(ProbeError::Network(msg.to_string())),
                Step::Slow(d, ms) => {
                    tokio::time::sleep(d).await;
                    Ok(ms)
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
