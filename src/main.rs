//! PingWarden - device reachability monitoring service.
//!
//! Probes inventory devices on per-device intervals, tracks debounced
//! ONLINE/OFFLINE status, raises alerts and serves statistics over HTTP.

mod config;
mod db;
mod error;
mod inventory;
mod monitor;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use inventory::StoreDirectory;
use monitor::MonitoringService;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pingwarden=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting PingWarden on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let prober = probe::prober_for(cfg.monitor.probe_kind);
    tracing::info!("Using {} probes", prober.name());

    let directory = Arc::new(StoreDirectory::new(store.clone()));
    let service = Arc::new(MonitoringService::new(cfg.monitor.clone(), store, directory, prober));
    service.start().await?;

    // Start web server
    let server = Server::new(cfg, service);
    server.start().await?;

    Ok(())
}
