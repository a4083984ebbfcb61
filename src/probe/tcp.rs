//! TCP connect probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{ProbeError, Prober};

/// Treats a completed handshake, or an immediate refusal, as "host reachable".
#[derive(Debug, Clone)]
pub struct TcpProber {
    default_port: u16,
}

impl TcpProber {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    /// Split `address` into host and port, applying the default port.
    fn endpoint(&self, address: &str) -> (String, u16) {
        if let Ok(sa) = address.parse::<SocketAddr>() {
            return (sa.ip().to_string(), sa.port());
        }
        // Bare IPv6 literals contain colons but no port.
        if address.matches(':').count() == 1 {
            if let Some((host, port)) = address.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    return (host.to_string(), port);
                }
            }
        }
        let host = address.trim_start_matches('[').trim_end_matches(']');
        (host.to_string(), self.default_port)
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn check(&self, address: &str, timeout: Duration) -> Result<f64, ProbeError> {
        let (host, port) = self.endpoint(address);
        let ip = super::ping::resolve_address(&host).await?;

        let start = Instant::now();
        let attempt = tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, port))).await;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;

        match attempt {
            Err(_) => Err(ProbeError::Timeout(timeout)),
            Ok(Ok(_stream)) => Ok(elapsed),
            // A RST means the host itself answered.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(elapsed),
            Ok(Err(e)) => Err(ProbeError::Network(format!("connect to {}:{} failed: {}", host, port, e))),
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}
