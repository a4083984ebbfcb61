//! Error taxonomy for the monitoring API.
//!
//! Probe failures never show up here; they are recorded as `ProbeResult`s.

use thiserror::Error;
use uuid::Uuid;

use crate::db::DbError;
use crate::inventory::InventoryError;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("alert {0} is already resolved")]
    AlreadyResolved(Uuid),
    #[error("storage error: {0}")]
    Store(#[from] DbError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("monitoring pipeline for device {0} is not running")]
    PipelineClosed(Uuid),
}

impl MonitorError {
    pub fn device_not_found(id: Uuid) -> Self {
        MonitorError::NotFound { kind: "device", id: id.to_string() }
    }

    pub fn alert_not_found(id: Uuid) -> Self {
        MonitorError::NotFound { kind: "alert", id: id.to_string() }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
