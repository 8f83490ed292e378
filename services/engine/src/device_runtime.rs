//! Runtime Device State and the Runtime Device Map.
//!
//! The scheduler owns the map; the Device Monitor and Control Handler
//! mutate it only through this narrow API (add/remove/refresh) — an
//! `Arc<RwLock<HashMap<...>>>` registry with no back-references out to
//! the pool or breaker registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use engine_proto::indexmap_compat::IndexMap;
use engine_proto::{Device, DeviceType, TransmissionConfig};
use tokio::sync::RwLock;

/// The mutable per-device record the scheduler reads each tick.
/// Lives only in memory; destroyed when the device is dropped from the
/// map.
pub struct RuntimeDeviceState {
    pub device_id: String,
    pub device_ref: String,
    pub connection_id: String,
    pub project_id: Option<String>,
    pub device_type: DeviceType,

    /// Mutated in place by the Device Monitor's periodic reconciliation;
    /// every dispatch reads these concurrently, hence atomics rather
    /// than plain fields requiring `&mut` through a shared `Arc`.
    pub frequency_seconds: AtomicU32,
    pub batch_size: AtomicU32,
    pub auto_reset: AtomicBool,
    pub jitter_ms: AtomicU32,
    pub retry_on_error: AtomicBool,
    pub max_retries: AtomicU32,
    pub include_device_id: AtomicBool,
    pub include_timestamp: AtomicBool,

    pub current_row_index: std::sync::atomic::AtomicU64,
    pub dataset_rows: RwLock<Arc<Vec<IndexMap>>>,
    /// Composite of each linked dataset's `(id, file_hash)`, used by the
    /// Device Monitor to skip re-installing `dataset_rows` when nothing
    /// about the underlying files changed since the last reconcile pass.
    dataset_fingerprint: RwLock<String>,
    pub consecutive_error_count: std::sync::atomic::AtomicU32,

    /// Set before dispatch, cleared on every exit path including errors.
    /// The Scheduler and Control Handler both consult this.
    in_flight: AtomicBool,

    /// Wall-clock-independent scheduling clock — the selection phase
    /// never blocks on I/O, so it can't use a wall-clock timestamp that
    /// might jump.
    pub last_transmission_monotonic: RwLock<Option<Instant>>,
    pub next_jitter_offset_ms: std::sync::atomic::AtomicU32,
}

impl RuntimeDeviceState {
    pub fn new(device: &Device, connection_id: String, dataset_rows: Vec<IndexMap>) -> Self {
        let cfg: TransmissionConfig = device.transmission_config;
        // Sensors are capped at batch_size=1 as a safety net even though the
        // control plane is expected to enforce this already.
        let batch_size = if device.device_type == DeviceType::Sensor {
            1
        } else {
            cfg.batch_size.max(1)
        };
        Self {
            device_id: device.id.clone(),
            device_ref: device.device_ref.clone(),
            connection_id,
            project_id: device.project_id.clone(),
            device_type: device.device_type,
            frequency_seconds: AtomicU32::new(device.transmission_frequency_seconds.clamp(1, 172_800)),
            batch_size: AtomicU32::new(batch_size),
            auto_reset: AtomicBool::new(cfg.auto_reset),
            jitter_ms: AtomicU32::new(cfg.jitter_ms),
            retry_on_error: AtomicBool::new(cfg.retry_on_error),
            max_retries: AtomicU32::new(cfg.max_retries.max(1)),
            include_device_id: AtomicBool::new(cfg.include_device_id),
            include_timestamp: AtomicBool::new(cfg.include_timestamp),
            current_row_index: std::sync::atomic::AtomicU64::new(device.current_row_index),
            dataset_rows: RwLock::new(Arc::new(dataset_rows)),
            dataset_fingerprint: RwLock::new(String::new()),
            consecutive_error_count: std::sync::atomic::AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            last_transmission_monotonic: RwLock::new(None),
            next_jitter_offset_ms: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Update the mutable fields a Device Monitor cycle may change,
    /// without disturbing `current_row_index` or in-flight state.
    /// Takes `&self`: every field it touches is an atomic, since other
    /// dispatches may be reading through a cloned `Arc` concurrently.
    pub fn refresh_config(&self, device: &Device) {
        let cfg = device.transmission_config;
        let batch_size = if self.device_type == DeviceType::Sensor { 1 } else { cfg.batch_size.max(1) };
        self.frequency_seconds.store(device.transmission_frequency_seconds.clamp(1, 172_800), Ordering::SeqCst);
        self.batch_size.store(batch_size, Ordering::SeqCst);
        self.auto_reset.store(cfg.auto_reset, Ordering::SeqCst);
        self.jitter_ms.store(cfg.jitter_ms, Ordering::SeqCst);
        self.retry_on_error.store(cfg.retry_on_error, Ordering::SeqCst);
        self.max_retries.store(cfg.max_retries.max(1), Ordering::SeqCst);
        self.include_device_id.store(cfg.include_device_id, Ordering::SeqCst);
        self.include_timestamp.store(cfg.include_timestamp, Ordering::SeqCst);
    }

    /// Replace `dataset_rows` only if `fingerprint` differs from the one
    /// recorded at the last load — the common no-change reconcile pass
    /// stays a single fingerprint comparison, not a dataset_rows swap.
    pub async fn refresh_dataset_rows_if_changed(&self, rows: Vec<IndexMap>, fingerprint: String) {
        {
            let current = self.dataset_fingerprint.read().await;
            if *current == fingerprint {
                return;
            }
        }
        *self.dataset_rows.write().await = Arc::new(rows);
        *self.dataset_fingerprint.write().await = fingerprint;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Attempt to claim the in-flight flag; returns `false` if another
    /// dispatch already holds it. Never two dispatches for the same
    /// device at once.
    pub fn try_begin_dispatch(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_dispatch(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub async fn dataset_row_count(&self) -> u64 {
        self.dataset_rows.read().await.len() as u64
    }

    pub async fn is_due(&self, now: Instant) -> bool {
        if self.is_in_flight() {
            return false;
        }
        let last = *self.last_transmission_monotonic.read().await;
        let due_after = std::time::Duration::from_secs(self.frequency_seconds.load(Ordering::SeqCst) as u64)
            + std::time::Duration::from_millis(self.next_jitter_offset_ms.load(Ordering::SeqCst) as u64);
        match last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= due_after,
        }
    }

    /// Stamp the dispatch start time and sample a fresh jitter offset for
    /// the *next* due calculation.
    pub async fn mark_dispatch_started(&self, now: Instant) {
        *self.last_transmission_monotonic.write().await = Some(now);
        let jitter_ms = self.jitter_ms.load(Ordering::SeqCst);
        let offset = if jitter_ms > 0 {
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..=jitter_ms)
        } else {
            0
        };
        self.next_jitter_offset_ms.store(offset, Ordering::SeqCst);
    }
}

/// The scheduler-owned process-wide runtime device map. A
/// snapshot of the keyset is taken each tick to avoid iterator
/// invalidation while dispatches run concurrently.
#[derive(Clone)]
pub struct RuntimeDeviceMap {
    inner: Arc<RwLock<HashMap<String, Arc<RuntimeDeviceState>>>>,
}

impl Default for RuntimeDeviceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeDeviceMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, state: RuntimeDeviceState) {
        self.inner.write().await.insert(state.device_id.clone(), Arc::new(state));
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<RuntimeDeviceState>> {
        self.inner.read().await.get(device_id).cloned()
    }

    pub async fn remove(&self, device_id: &str) -> Option<Arc<RuntimeDeviceState>> {
        self.inner.write().await.remove(device_id)
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.inner.read().await.contains_key(device_id)
    }

    /// A point-in-time snapshot of the keyset, taken once per tick so the
    /// scheduler never holds the map lock while dispatching.
    pub async fn snapshot_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> Vec<Arc<RuntimeDeviceState>> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Connections still referenced by at least one runtime device,
    /// used by the Control Handler to decide whether to release a pool
    /// handle / reset a breaker on stop.
    pub async fn connection_in_use(&self, connection_id: &str, excluding_device: &str) -> bool {
        self.inner
            .read()
            .await
            .values()
            .any(|d| d.device_id != excluding_device && d.connection_id == connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_proto::{DeviceStatus, DeviceType};

    fn sample_device() -> Device {
        Device {
            id: "dev-1".into(),
            device_ref: "DEV00001".into(),
            device_type: DeviceType::Sensor,
            connection_id: Some("conn-1".into()),
            project_id: None,
            transmission_enabled: true,
            transmission_frequency_seconds: 1,
            transmission_config: TransmissionConfig {
                batch_size: 5,
                ..TransmissionConfig::default()
            },
            current_row_index: 0,
            status: DeviceStatus::Idle,
            last_transmission_at: None,
            is_active: true,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn sensor_batch_size_capped_at_one_even_if_configured_higher() {
        let device = sample_device();
        let state = RuntimeDeviceState::new(&device, "conn-1".into(), vec![]);
        assert_eq!(state.batch_size.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_config_updates_frequency_without_mut_borrow() {
        let device = sample_device();
        let state = RuntimeDeviceState::new(&device, "conn-1".into(), vec![]);
        assert_eq!(state.frequency_seconds.load(Ordering::SeqCst), 1);

        let mut updated = device;
        updated.transmission_frequency_seconds = 30;
        updated.transmission_config.max_retries = 7;
        state.refresh_config(&updated);

        assert_eq!(state.frequency_seconds.load(Ordering::SeqCst), 30);
        assert_eq!(state.max_retries.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn refresh_dataset_rows_if_changed_skips_unchanged_fingerprint() {
        let device = sample_device();
        let state = RuntimeDeviceState::new(&device, "conn-1".into(), vec![row_of("1")]);

        state.refresh_dataset_rows_if_changed(vec![row_of("1")], String::new()).await;
        assert_eq!(state.dataset_row_count().await, 1, "same fingerprint ('') leaves rows untouched");

        state.refresh_dataset_rows_if_changed(vec![row_of("1"), row_of("2")], "ds-1:hash2".into()).await;
        assert_eq!(state.dataset_row_count().await, 2, "new fingerprint installs the new rows");

        state.refresh_dataset_rows_if_changed(vec![row_of("9")], "ds-1:hash2".into()).await;
        assert_eq!(state.dataset_row_count().await, 2, "repeat fingerprint is a no-op even with different rows passed in");
    }

    fn row_of(v: &str) -> IndexMap {
        let mut row = IndexMap::new();
        row.insert("v".to_owned(), serde_json::Value::String(v.to_owned()));
        row
    }

    #[tokio::test]
    async fn in_flight_flag_excludes_concurrent_dispatch() {
        let device = sample_device();
        let state = RuntimeDeviceState::new(&device, "conn-1".into(), vec![]);
        assert!(state.try_begin_dispatch());
        assert!(!state.try_begin_dispatch());
        state.end_dispatch();
        assert!(state.try_begin_dispatch());
    }

    #[tokio::test]
    async fn map_insert_get_remove_roundtrip() {
        let map = RuntimeDeviceMap::new();
        let device = sample_device();
        map.insert(RuntimeDeviceState::new(&device, "conn-1".into(), vec![])).await;
        assert!(map.contains("dev-1").await);
        assert_eq!(map.len().await, 1);
        map.remove("dev-1").await;
        assert!(!map.contains("dev-1").await);
    }

    #[tokio::test]
    async fn connection_in_use_ignores_the_excluded_device() {
        let map = RuntimeDeviceMap::new();
        let device = sample_device();
        map.insert(RuntimeDeviceState::new(&device, "conn-shared".into(), vec![])).await;
        assert!(!map.connection_in_use("conn-shared", "dev-1").await);

        let mut other = sample_device();
        other.id = "dev-2".into();
        map.insert(RuntimeDeviceState::new(&other, "conn-shared".into(), vec![])).await;
        assert!(map.connection_in_use("conn-shared", "dev-1").await);
    }
}
