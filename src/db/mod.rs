//! Database module.
//!
//! SQLite storage for targets, raw probe results, rollups, status history
//! and alerts.

mod models;
mod store;
mod tdigest_utils;

pub use models::*;
pub use store::*;
pub use tdigest_utils::*;
