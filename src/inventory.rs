//! Device inventory lookups.
//!
//! The inventory service owns device metadata; the engine keeps a local copy
//! in the `devices` table, refreshed by inventory sync calls, and consults it
//! before every probe so address edits apply without re-arming.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{DbError, DeviceRecord, Store};

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("inventory store: {0}")]
    Store(#[from] DbError),
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// Read access to device inventory records.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn resolve(&self, device_id: Uuid) -> Result<Option<DeviceRecord>, InventoryError>;

    async fn list(&self) -> Result<Vec<DeviceRecord>, InventoryError>;
}

/// Directory backed by the local `devices` table.
#[derive(Clone)]
pub struct StoreDirectory {
    store: Arc<Store>,
}

impl StoreDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeviceDirectory for StoreDirectory {
    async fn resolve(&self, device_id: Uuid) -> Result<Option<DeviceRecord>, InventoryError> {
        Ok(self.store.get_device(device_id)?)
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
        Ok(self.store.get_devices()?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory directory for tests.
    #[derive(Default)]
    pub struct MemoryDirectory {
        devices: Mutex<BTreeMap<Uuid, DeviceRecord>>,
    }

    impl MemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add(&self, device_id: Uuid, ip: &str) -> DeviceRecord {
            let record = DeviceRecord {
                device_id,
                name: format!("device-{}", ip),
                ip_address: Some(ip.to_string()),
                hostname: None,
            };
            self.devices.lock().unwrap().insert(device_id, record.clone());
            record
        }

        pub fn set_hostname(&self, device_id: Uuid, hostname: &str) {
            if let Some(r) = self.devices.lock().unwrap().get_mut(&device_id) {
                r.hostname = Some(hostname.to_string());
            }
        }
    }

    #[async_trait]
    impl DeviceDirectory for MemoryDirectory {
        async fn resolve(&self, device_id: Uuid) -> Result<Option<DeviceRecord>, InventoryError> {
            Ok(self.devices.lock().unwrap().get(&device_id).cloned())
        }

        async fn list(&self) -> Result<Vec<DeviceRecord>, InventoryError> {
            Ok(self.devices.lock().unwrap().values().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_store_directory_lookup() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let directory = StoreDirectory::new(store.clone());

        let id = Uuid::new_v4();
        assert!(directory.resolve(id).await.unwrap().is_none());

        store
            .upsert_device(&DeviceRecord {
                device_id: id,
                name: "nas".to_string(),
                ip_address: Some("10.1.1.5".to_string()),
                hostname: Some("nas.lan".to_string()),
            })
            .unwrap();

        let record = directory.resolve(id).await.unwrap().unwrap();
        assert_eq!(record.probe_address(), Some("nas.lan"));
        assert_eq!(directory.list().await.unwrap().len(), 1);
    }
}
