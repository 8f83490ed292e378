//! In-memory and in-process fakes for exercising the transmission engine
//! end-to-end without a real Postgres instance or live protocol backends.
//!
//! `MockHttpSink` binds a real `axum` server on a random localhost port,
//! so the HTTP protocol adapter (`engine::adapters::http`) exercises its
//! real networking code path against a server this crate controls,
//! rather than mocking the adapter itself.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use engine::blob_store::{BlobError, BlobStore};
use engine::store::{DeviceProgressUpdate, MetadataStore, StoreError};
use engine_proto::indexmap_compat::IndexMap;
use engine_proto::{Connection, Dataset, DatasetFormat, Device, DeviceDatasetLink, TransmissionLogRecord};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// In-memory metadata store
// ---------------------------------------------------------------------------

/// A seedable, in-process stand-in for the shared relational metadata
/// store, used by the root crate's end-to-end suite in place of a real
/// Postgres instance — `store/postgres.rs` is exercised separately
/// against a real database via `testcontainers`.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    devices: HashMap<String, Device>,
    connections: HashMap<String, Connection>,
    datasets: HashMap<String, Dataset>,
    links: HashMap<String, Vec<DeviceDatasetLink>>,
    logs: Vec<TransmissionLogRecord>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_device(&self, device: Device) {
        self.inner.lock().await.devices.insert(device.id.clone(), device);
    }

    pub async fn seed_connection(&self, connection: Connection) {
        self.inner.lock().await.connections.insert(connection.id.clone(), connection);
    }

    pub async fn seed_dataset(&self, dataset: Dataset) {
        self.inner.lock().await.datasets.insert(dataset.id.clone(), dataset);
    }

    pub async fn seed_link(&self, link: DeviceDatasetLink) {
        self.inner.lock().await.links.entry(link.device_id.clone()).or_default().push(link);
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.lock().await.devices.get(device_id).cloned()
    }

    pub async fn logs(&self) -> Vec<TransmissionLogRecord> {
        self.inner.lock().await.logs.clone()
    }

    pub async fn log_count(&self) -> usize {
        self.inner.lock().await.logs.len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn fetch_active_devices(&self, limit: u64) -> Result<Vec<Device>, StoreError> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<Device> = inner.devices.values().filter(|d| d.qualifies_for_transmission()).cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices.truncate(limit as usize);
        Ok(devices)
    }

    async fn fetch_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.inner.lock().await.devices.get(device_id).cloned())
    }

    async fn fetch_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.inner.lock().await.connections.get(connection_id).cloned())
    }

    async fn fetch_dataset_links(&self, device_id: &str) -> Result<Vec<DeviceDatasetLink>, StoreError> {
        let inner = self.inner.lock().await;
        let mut links = inner.links.get(device_id).cloned().unwrap_or_default();
        links.sort_by(|a, b| a.linked_at.cmp(&b.linked_at).then_with(|| a.dataset_id.cmp(&b.dataset_id)));
        Ok(links)
    }

    async fn fetch_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>, StoreError> {
        Ok(self.inner.lock().await.datasets.get(dataset_id).cloned())
    }

    async fn commit_dispatch(&self, update: DeviceProgressUpdate, logs: &[TransmissionLogRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.get_mut(&update.device_id).ok_or(StoreError::NotFound)?;
        if let Some(idx) = update.current_row_index {
            device.current_row_index = idx;
        }
        if let Some(status) = update.status {
            device.status = status;
        }
        if let Some(at) = update.last_transmission_at {
            device.last_transmission_at = Some(at);
        }
        if let Some(enabled) = update.transmission_enabled {
            device.transmission_enabled = enabled;
        }
        inner.logs.extend(logs.iter().cloned());
        Ok(())
    }

    async fn pause_device(&self, device_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.get_mut(device_id).ok_or(StoreError::NotFound)?;
        device.transmission_enabled = false;
        device.status = engine_proto::DeviceStatus::Idle;
        Ok(())
    }

    async fn stop_device(&self, device_id: &str, reset_row_index: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let device = inner.devices.get_mut(device_id).ok_or(StoreError::NotFound)?;
        device.status = engine_proto::DeviceStatus::Idle;
        if reset_row_index {
            device.current_row_index = 0;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory blob store
// ---------------------------------------------------------------------------

/// A seedable dataset-row source standing in for `FsBlobStore`, so tests
/// don't need temp files on disk. `replace` lets a test bump a dataset's
/// content and hash mid-run to exercise the metadata cache's staleness
/// check.
#[derive(Default)]
pub struct InMemoryBlobStore {
    inner: Mutex<HashMap<String, (Vec<IndexMap>, String)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, file_path: impl Into<String>, rows: Vec<IndexMap>) {
        let file_path = file_path.into();
        let hash = format!("{file_path}:gen0:{}", rows.len());
        self.inner.lock().await.insert(file_path, (rows, hash));
    }

    pub async fn replace(&self, file_path: impl Into<String>, rows: Vec<IndexMap>) {
        let file_path = file_path.into();
        let mut inner = self.inner.lock().await;
        let generation = inner.len();
        let hash = format!("{file_path}:gen{generation}:{}", rows.len());
        inner.insert(file_path, (rows, hash));
    }
}

fn not_seeded(file_path: &str) -> BlobError {
    BlobError::Io {
        path: file_path.to_owned(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "dataset not seeded"),
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn read_dataset(&self, file_path: &str, _format: DatasetFormat) -> Result<Vec<IndexMap>, BlobError> {
        self.inner.lock().await.get(file_path).map(|(rows, _)| rows.clone()).ok_or_else(|| not_seeded(file_path))
    }

    async fn file_hash(&self, file_path: &str) -> Result<String, BlobError> {
        self.inner.lock().await.get(file_path).map(|(_, hash)| hash.clone()).ok_or_else(|| not_seeded(file_path))
    }
}

// ---------------------------------------------------------------------------
// Mock HTTP sink (HTTP/HTTPS adapter, exercised against a real server)
// ---------------------------------------------------------------------------

/// Scripted response for one request to the mock sink.
#[derive(Debug, Clone, Copy)]
pub enum SinkOutcome {
    Ok,
    Status(u16),
}

struct SinkState {
    outcomes: Mutex<VecDeque<SinkOutcome>>,
    received: Mutex<Vec<serde_json::Value>>,
    request_count: AtomicUsize,
}

/// A real `axum` server bound to `127.0.0.1:0`, standing in for a
/// customer's HTTP ingestion endpoint. Every request is recorded and
/// answered with the next queued `SinkOutcome`, defaulting to `200 OK`
/// once the queue runs dry — enough to script retry exhaustion and
/// circuit-breaker trips deterministically.
pub struct MockHttpSink {
    addr: std::net::SocketAddr,
    state: Arc<SinkState>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockHttpSink {
    pub async fn start() -> Self {
        let state = Arc::new(SinkState {
            outcomes: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            request_count: AtomicUsize::new(0),
        });

        let app = Router::new().route("/ingest", post(handle_ingest)).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind mock http sink");
        let addr = listener.local_addr().expect("mock http sink local addr");

        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!("http://{}/ingest", self.addr)
    }

    /// Queue the outcome for the next request; requests beyond the queue
    /// default to `Ok`.
    pub async fn push_outcome(&self, outcome: SinkOutcome) {
        self.state.outcomes.lock().await.push_back(outcome);
    }

    pub async fn push_failures(&self, count: usize, status: u16) {
        let mut outcomes = self.state.outcomes.lock().await;
        for _ in 0..count {
            outcomes.push_back(SinkOutcome::Status(status));
        }
    }

    pub async fn received_bodies(&self) -> Vec<serde_json::Value> {
        self.state.received.lock().await.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.request_count.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_ingest(State(state): State<Arc<SinkState>>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    state.received.lock().await.push(body);
    let outcome = state.outcomes.lock().await.pop_front().unwrap_or(SinkOutcome::Ok);
    match outcome {
        SinkOutcome::Ok => StatusCode::OK.into_response(),
        SinkOutcome::Status(code) => StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

/// A device pointed at an HTTP connection, ready to seed into
/// `InMemoryMetadataStore`; callers override fields after construction.
pub fn http_device(id: &str, connection_id: &str, device_type: engine_proto::DeviceType) -> Device {
    Device {
        id: id.to_owned(),
        device_ref: id.to_uppercase(),
        device_type,
        connection_id: Some(connection_id.to_owned()),
        project_id: None,
        transmission_enabled: true,
        transmission_frequency_seconds: 1,
        transmission_config: engine_proto::TransmissionConfig::default(),
        current_row_index: 0,
        status: engine_proto::DeviceStatus::Idle,
        last_transmission_at: None,
        is_active: true,
        is_deleted: false,
    }
}

pub fn http_connection(id: &str, endpoint_url: &str) -> Connection {
    Connection {
        id: id.to_owned(),
        protocol: engine_proto::Protocol::Http,
        config: serde_json::json!({"endpoint_url": endpoint_url}),
        is_deleted: false,
    }
}

pub fn ready_dataset(id: &str, file_path: &str) -> Dataset {
    Dataset {
        id: id.to_owned(),
        file_path: file_path.to_owned(),
        file_format: DatasetFormat::Csv,
        row_count: 0,
        status: "ready".to_owned(),
    }
}

pub fn link(device_id: &str, dataset_id: &str, linked_at: chrono::DateTime<chrono::Utc>) -> DeviceDatasetLink {
    DeviceDatasetLink {
        device_id: device_id.to_owned(),
        dataset_id: dataset_id.to_owned(),
        config: serde_json::json!({}),
        linked_at,
    }
}

pub fn row(pairs: &[(&str, &str)]) -> IndexMap {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), serde_json::Value::String((*v).to_owned()))).collect()
}
