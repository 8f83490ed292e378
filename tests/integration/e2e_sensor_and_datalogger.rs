//! End-to-end: a sensor device (batch size forced to 1) and a
//! datalogger device (batch size 2) both transmitting against a real
//! HTTP sink, verifying the wire payload shape each produces and that
//! row-index bookkeeping advances in the metadata store.

use std::sync::Arc;

use chrono::Utc;
use engine::device_monitor::DeviceMonitor;
use engine::dispatch::dispatch_device;
use engine::{EngineConfig, Engine};
use engine_proto::{DeviceType, LogStatus};
use engine_test_utils::{http_connection, http_device, link, ready_dataset, row, InMemoryBlobStore, InMemoryMetadataStore, MockHttpSink};

#[tokio::test]
async fn sensor_sends_single_row_data_shape() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    store.seed_device(http_device("dev-sensor", "conn-1", DeviceType::Sensor)).await;
    store.seed_dataset(ready_dataset("ds-1", "sensor.csv")).await;
    store.seed_link(link("dev-sensor", "ds-1", Utc::now())).await;
    blobs
        .seed(
            "sensor.csv",
            vec![row(&[("temp", "21.5")]), row(&[("temp", "21.7")])],
        )
        .await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;

    let device = engine.devices.get("dev-sensor").await.expect("adopted");
    dispatch_device(&engine, &device).await;

    assert_eq!(sink.request_count(), 1);
    let bodies = sink.received_bodies().await;
    assert_eq!(bodies[0]["data"], serde_json::json!({"temp": "21.5"}));
    assert!(bodies[0].get("batch").is_none());

    let persisted = store.device("dev-sensor").await.unwrap();
    assert_eq!(persisted.current_row_index, 1);

    let logs = store.logs().await;
    assert_eq!(logs.len(), 1);
    assert!(matches!(logs[0].status, LogStatus::Success));
}

#[tokio::test]
async fn datalogger_sends_batch_shape_with_absolute_row_indices() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    let mut device = http_device("dev-logger", "conn-1", DeviceType::Datalogger);
    device.transmission_config.batch_size = 2;
    store.seed_device(device).await;
    store.seed_dataset(ready_dataset("ds-1", "logger.csv")).await;
    store.seed_link(link("dev-logger", "ds-1", Utc::now())).await;
    blobs
        .seed(
            "logger.csv",
            vec![row(&[("v", "1")]), row(&[("v", "2")]), row(&[("v", "3")])],
        )
        .await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;

    let device = engine.devices.get("dev-logger").await.expect("adopted");
    assert_eq!(device.batch_size.load(std::sync::atomic::Ordering::SeqCst), 2);
    dispatch_device(&engine, &device).await;

    let bodies = sink.received_bodies().await;
    assert_eq!(
        bodies[0]["batch"],
        serde_json::json!([
            {"row": 0, "data": {"v": "1"}},
            {"row": 1, "data": {"v": "2"}},
        ])
    );

    let persisted = store.device("dev-logger").await.unwrap();
    assert_eq!(persisted.current_row_index, 2);
}

#[tokio::test]
async fn reconcile_reloads_dataset_rows_when_file_hash_changes() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    store.seed_device(http_device("dev-sensor", "conn-1", DeviceType::Sensor)).await;
    store.seed_dataset(ready_dataset("ds-1", "sensor.csv")).await;
    store.seed_link(link("dev-sensor", "ds-1", Utc::now())).await;
    blobs.seed("sensor.csv", vec![row(&[("temp", "21.5")])]).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    let monitor = DeviceMonitor::new(engine.clone());
    monitor.reconcile_once().await;

    let device = engine.devices.get("dev-sensor").await.expect("adopted");
    assert_eq!(device.dataset_row_count().await, 1);

    // Dataset content changes (new file hash) without the device being
    // dropped/re-adopted — the next reconcile pass alone must pick it up.
    blobs
        .replace("sensor.csv", vec![row(&[("temp", "99.0")]), row(&[("temp", "99.1")])])
        .await;
    monitor.reconcile_once().await;

    let refreshed = engine.devices.get("dev-sensor").await.expect("still adopted");
    assert_eq!(refreshed.dataset_row_count().await, 2);

    dispatch_device(&engine, &refreshed).await;
    let bodies = sink.received_bodies().await;
    assert_eq!(bodies[0]["data"], serde_json::json!({"temp": "99.0"}));
}
