//! The metadata store interface and its Postgres implementation.
//!
//! The engine reads connections/devices/datasets/device_datasets and
//! writes only `devices.current_row_index/status/last_transmission_at`
//! and `transmission_logs` (append-only). Everything else about those
//! tables — CRUD, auth, uploads — belongs to the control-plane service
//! and is out of scope here.

pub mod postgres;

use async_trait::async_trait;
use engine_proto::{Connection, Dataset, Device, DeviceDatasetLink, TransmissionLogRecord};

pub use postgres::PostgresMetadataStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("not found")]
    NotFound,
}

/// A partial update to a device's persistent state. Only the fields
/// that changed are carried; the repo layer applies them atomically in
/// one `UPDATE`.
#[derive(Debug, Clone)]
pub struct DeviceProgressUpdate {
    pub device_id: String,
    pub current_row_index: Option<u64>,
    pub status: Option<engine_proto::DeviceStatus>,
    pub last_transmission_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Set only on end-of-dataset pause.
    pub transmission_enabled: Option<bool>,
}

impl DeviceProgressUpdate {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            current_row_index: None,
            status: None,
            last_transmission_at: None,
            transmission_enabled: None,
        }
    }
}

/// Narrow interface onto the shared relational metadata store.
/// The engine never performs CRUD beyond what's listed here.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Devices where `is_deleted=false AND is_active=true AND
    /// transmission_enabled=true AND connection_id IS NOT NULL`, capped at
    /// `limit`.
    async fn fetch_active_devices(&self, limit: u64) -> Result<Vec<Device>, StoreError>;

    async fn fetch_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    async fn fetch_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError>;

    /// Dataset links for a device, ordered by `linked_at` ascending then
    /// `dataset_id` as tiebreaker.
    async fn fetch_dataset_links(&self, device_id: &str) -> Result<Vec<DeviceDatasetLink>, StoreError>;

    async fn fetch_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError>;

    /// Apply a partial device-state update and append transmission log
    /// records in one transaction.
    async fn commit_dispatch(
        &self,
        update: DeviceProgressUpdate,
        logs: &[TransmissionLogRecord],
    ) -> Result<(), StoreError>;

    /// Pause a device at end-of-dataset with no auto-reset: write
    /// `transmission_enabled=false, status=idle`, leave `current_row_index`
    /// untouched.
    async fn pause_device(&self, device_id: &str) -> Result<(), StoreError>;

    /// Control-plane stop: write `status=idle`, and if
    /// `reset_row_index` is set, `current_row_index=0`.
    async fn stop_device(&self, device_id: &str, reset_row_index: bool) -> Result<(), StoreError>;
}
