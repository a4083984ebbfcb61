//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::monitor::MonitoringService;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub service: Arc<MonitoringService>,
}

/// HTTP front end for the monitoring engine.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, service: Arc<MonitoringService>) -> Self {
        Self { state: AppState { config, service } }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            // Inventory sync
            .route(
                "/api/devices/{id}",
                put(handlers::handle_upsert_device).delete(handlers::handle_delete_device),
            )
            // Monitoring control
            .route(
                "/api/devices/{id}/monitoring",
                post(handlers::handle_start_monitoring).delete(handlers::handle_stop_monitoring),
            )
            .route("/api/monitoring/start-all", post(handlers::handle_start_all))
            .route("/api/monitoring/stop-all", post(handlers::handle_stop_all))
            .route("/api/targets", get(handlers::handle_get_targets))
            // Status and statistics
            .route("/api/devices/{id}/status", get(handlers::handle_get_status))
            .route("/api/devices/{id}/statistics", get(handlers::handle_get_statistics))
            .route("/api/devices/{id}/results", get(handlers::handle_get_results))
            .route("/api/devices/{id}/history", get(handlers::handle_get_history))
            // Alerts
            .route(
                "/api/alerts",
                get(handlers::handle_list_alerts).post(handlers::handle_create_alert),
            )
            .route("/api/alerts/stats", get(handlers::handle_alert_stats))
            .route("/api/alerts/{id}", axum::routing::delete(handlers::handle_delete_alert))
            .route("/api/alerts/{id}/acknowledge", post(handlers::handle_acknowledge_alert))
            .route("/api/alerts/{id}/resolve", post(handlers::handle_resolve_alert))
            // Push feed
            .route("/api/events", get(handlers::handle_events))
            .route("/api/health", get(handlers::handle_health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
