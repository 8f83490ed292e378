//! End-to-end: the control-plane callback surface (`ControlHandler`)
//! adopts a device on start, and on stop removes it from the runtime
//! map immediately while only releasing the shared connection's pool
//! handle and circuit breaker once no other device still uses it.

use std::sync::Arc;

use chrono::Utc;
use engine::control::ControlHandler;
use engine::{Engine, EngineConfig};
use engine_proto::DeviceType;
use engine_test_utils::{http_connection, http_device, link, ready_dataset, row, InMemoryBlobStore, InMemoryMetadataStore, MockHttpSink};

#[tokio::test]
async fn start_adopts_device_and_stop_removes_it() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    store.seed_device(http_device("dev-1", "conn-1", DeviceType::Sensor)).await;
    store.seed_dataset(ready_dataset("ds-1", "rows.csv")).await;
    store.seed_link(link("dev-1", "ds-1", Utc::now())).await;
    blobs.seed("rows.csv", vec![row(&[("v", "1")])]).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    let handler = ControlHandler::new(engine.clone());

    handler.start("dev-1").await.unwrap();
    assert!(engine.devices.contains("dev-1").await);
    let adopted = engine.devices.get("dev-1").await.unwrap();
    assert_eq!(adopted.dataset_row_count().await, 1);

    handler.stop("dev-1", false).await.unwrap();
    assert!(!engine.devices.contains("dev-1").await);

    let persisted = store.device("dev-1").await.unwrap();
    assert!(matches!(persisted.status, engine_proto::DeviceStatus::Idle));
    assert_eq!(persisted.current_row_index, 0, "reset_row_index=false leaves the row index untouched");
}

#[tokio::test]
async fn stop_with_reset_row_index_zeroes_progress() {
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", "http://unused/ingest")).await;
    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.current_row_index = 42;
    store.seed_device(device).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    let handler = ControlHandler::new(engine.clone());

    handler.start("dev-1").await.unwrap();
    handler.stop("dev-1", true).await.unwrap();

    let persisted = store.device("dev-1").await.unwrap();
    assert_eq!(persisted.current_row_index, 0);
}

#[tokio::test]
async fn stop_only_releases_shared_connection_once_no_device_remains() {
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-shared", "http://unused/ingest")).await;
    store.seed_device(http_device("dev-1", "conn-shared", DeviceType::Sensor)).await;
    store.seed_device(http_device("dev-2", "conn-shared", DeviceType::Sensor)).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    let handler = ControlHandler::new(engine.clone());

    handler.start("dev-1").await.unwrap();
    handler.start("dev-2").await.unwrap();

    // Manufacture breaker state so we can observe whether `stop` resets it.
    engine.breakers.record_failure("conn-shared").await;

    handler.stop("dev-1", false).await.unwrap();
    assert!(
        engine.breakers.snapshot("conn-shared").await.is_some(),
        "dev-2 still uses the connection, so its breaker state survives"
    );

    handler.stop("dev-2", false).await.unwrap();
    assert!(
        engine.breakers.snapshot("conn-shared").await.is_none(),
        "last user stopping resets the shared connection's breaker"
    );
}

#[tokio::test]
async fn start_is_a_no_op_for_a_device_that_no_longer_qualifies() {
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.transmission_enabled = false;
    store.seed_device(device).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    let handler = ControlHandler::new(engine.clone());

    handler.start("dev-1").await.unwrap();
    assert!(!engine.devices.contains("dev-1").await);
}
