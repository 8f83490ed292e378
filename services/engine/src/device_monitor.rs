//! Device Monitor: reconciles the Runtime Device Map with the
//! metadata store on a fixed cadence — a dedicated loop per
//! reconciliation concern, the same shape as other periodic discovery
//! and replay tasks in this codebase.

use std::sync::atomic::Ordering;

use engine_proto::{indexmap_compat::IndexMap, Device};
use tracing::{debug, warn};

use crate::device_runtime::RuntimeDeviceState;
use crate::Engine;

pub struct DeviceMonitor {
    engine: Engine,
}

impl DeviceMonitor {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Long-running loop at `device_monitor_interval_seconds` cadence.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.engine.config.device_monitor_interval());
        loop {
            ticker.tick().await;
            self.reconcile_once().await;
        }
    }

    /// One reconciliation pass. Adopts newly-qualifying devices,
    /// drops ones that no longer qualify, and refreshes mutable fields
    /// on devices already present.
    pub async fn reconcile_once(&self) {
        let start = std::time::Instant::now();
        let fetched = match self.engine.store.fetch_active_devices(self.engine.config.max_active_devices).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "device monitor: failed to fetch active devices");
                return;
            }
        };

        let fetched_ids: std::collections::HashSet<String> = fetched.iter().map(|d| d.id.clone()).collect();

        for id in self.engine.devices.snapshot_ids().await {
            if !fetched_ids.contains(&id) {
                self.engine.devices.remove(&id).await;
                debug!(device_id = %id, "device monitor: dropped runtime state (no longer qualifies)");
            }
        }

        for device in &fetched {
            self.adopt_or_refresh(device).await;
        }

        self.engine.stats.set_active_devices(self.engine.devices.len().await as u64);
        self.engine.stats.record_monitor_duration(start.elapsed());
    }

    async fn adopt_or_refresh(&self, device: &Device) {
        let Some(connection_id) = device.connection_id.clone() else { return };

        if let Some(existing) = self.engine.devices.get(&device.id).await {
            if existing.connection_id != connection_id {
                // Reassigned connection: treat like disable+re-enable so
                // the dataset/connection snapshot is rebuilt cleanly.
                self.engine.devices.remove(&device.id).await;
            } else {
                // Resync `current_row_index` from the database unless a
                // dispatch is currently in flight, which would otherwise
                // race with its own uncommitted advance.
                if !existing.is_in_flight() {
                    existing.current_row_index.store(device.current_row_index, Ordering::SeqCst);
                }
                existing.refresh_config(device);

                // Only reloads dataset_rows when a linked dataset's file
                // hash (or the link set itself) actually changed.
                let (rows, fingerprint) = load_dataset_rows_with_fingerprint(&self.engine, &device.id).await;
                existing.refresh_dataset_rows_if_changed(rows, fingerprint).await;
                return;
            }
        }

        let (rows, _fingerprint) = load_dataset_rows_with_fingerprint(&self.engine, &device.id).await;
        self.engine.devices.insert(RuntimeDeviceState::new(device, connection_id, rows)).await;
        debug!(device_id = %device.id, "device monitor: adopted runtime state");
    }
}

/// Load and concatenate dataset rows for a device's linked datasets, in
/// stable link order (`linked_at` ascending, `dataset_id` tiebreak).
/// Datasets whose `status` isn't (case-insensitively) `ready` are
/// skipped.
pub(crate) async fn load_dataset_rows(engine: &Engine, device_id: &str) -> Vec<IndexMap> {
    load_dataset_rows_with_fingerprint(engine, device_id).await.0
}

/// Same as `load_dataset_rows`, plus a cheap composite fingerprint
/// (`dataset_id:file_hash` pairs, comma-joined) callers can use to skip
/// reinstalling unchanged rows into a runtime device.
async fn load_dataset_rows_with_fingerprint(engine: &Engine, device_id: &str) -> (Vec<IndexMap>, String) {
    let links = match engine.store.fetch_dataset_links(device_id).await {
        Ok(links) => links,
        Err(e) => {
            warn!(device_id = %device_id, error = %e, "device monitor: failed to fetch dataset links");
            return (vec![], String::new());
        }
    };

    let mut rows = Vec::new();
    let mut fingerprint_parts = Vec::new();
    for link in links {
        let dataset = match engine.store.fetch_dataset(&link.dataset_id).await {
            Ok(Some(d)) => d,
            Ok(None) => continue,
            Err(e) => {
                warn!(dataset_id = %link.dataset_id, error = %e, "device monitor: failed to fetch dataset");
                continue;
            }
        };
        if !dataset.is_ready() {
            continue;
        }
        let file_hash = engine.blobs.file_hash(&dataset.file_path).await.unwrap_or_default();
        fingerprint_parts.push(format!("{}:{}", dataset.id, file_hash));
        match engine
            .cache
            .get_dataset_rows(&dataset.id, &dataset.file_path, dataset.file_format, engine.blobs.as_ref(), &engine.stats)
            .await
        {
            Ok(dataset_rows) => rows.extend(dataset_rows.iter().cloned()),
            Err(e) => warn!(dataset_id = %dataset.id, error = %e, "device monitor: failed to load dataset rows"),
        }
    }
    (rows, fingerprint_parts.join(","))
}
