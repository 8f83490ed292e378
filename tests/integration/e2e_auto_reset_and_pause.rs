//! End-to-end: reaching the end of a dataset either pauses the device
//! (no auto-reset) or wraps the row index back to zero and keeps going
//! (auto-reset enabled).

use std::sync::Arc;

use chrono::Utc;
use engine::device_monitor::DeviceMonitor;
use engine::dispatch::dispatch_device;
use engine::{Engine, EngineConfig};
use engine_proto::{DeviceStatus, DeviceType};
use engine_test_utils::{http_connection, http_device, link, ready_dataset, row, InMemoryBlobStore, InMemoryMetadataStore, MockHttpSink};

#[tokio::test]
async fn end_of_dataset_without_auto_reset_pauses_device() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.current_row_index = 1;
    store.seed_device(device).await;
    store.seed_dataset(ready_dataset("ds-1", "rows.csv")).await;
    store.seed_link(link("dev-1", "ds-1", Utc::now())).await;
    blobs.seed("rows.csv", vec![row(&[("v", "1")]), row(&[("v", "2")])]).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;
    let runtime = engine.devices.get("dev-1").await.expect("adopted");

    dispatch_device(&engine, &runtime).await;
    assert_eq!(sink.request_count(), 1, "one row left to send before reaching the end");

    let persisted = store.device("dev-1").await.unwrap();
    assert_eq!(persisted.current_row_index, 2);
    assert!(!persisted.transmission_enabled, "disabled in the same commit that crosses the end of the dataset");

    // The runtime state is still present (the Device Monitor, not this
    // dispatch, is what would normally drop it); calling dispatch again
    // now finds `current_row_index >= row_count` and takes the early
    // pause path that removes the runtime state.
    dispatch_device(&engine, &runtime).await;

    assert_eq!(sink.request_count(), 1, "no second request once past the end of the dataset");
    let persisted = store.device("dev-1").await.unwrap();
    assert!(matches!(persisted.status, DeviceStatus::Idle));
    assert!(!engine.devices.contains("dev-1").await, "paused device is dropped from the runtime map");
}

#[tokio::test]
async fn end_of_dataset_with_auto_reset_wraps_and_keeps_transmitting() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.current_row_index = 1;
    device.transmission_config.auto_reset = true;
    store.seed_device(device).await;
    store.seed_dataset(ready_dataset("ds-1", "rows.csv")).await;
    store.seed_link(link("dev-1", "ds-1", Utc::now())).await;
    blobs.seed("rows.csv", vec![row(&[("v", "1")]), row(&[("v", "2")])]).await;

    let engine = Engine::new(EngineConfig::default(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;
    let runtime = engine.devices.get("dev-1").await.expect("adopted");

    // First dispatch sends the one remaining row and lands exactly on
    // `current_row_index == row_count`; auto-reset means the device
    // stays enabled rather than pausing.
    dispatch_device(&engine, &runtime).await;
    let persisted = store.device("dev-1").await.unwrap();
    assert_eq!(persisted.current_row_index, 2);
    assert!(persisted.transmission_enabled, "auto-reset keeps transmitting past the end of the dataset");
    assert!(engine.devices.contains("dev-1").await);

    // Second dispatch finds `current_row_index >= row_count`, wraps back
    // to 0, and sends the first row again.
    dispatch_device(&engine, &runtime).await;
    let persisted = store.device("dev-1").await.unwrap();
    assert_eq!(persisted.current_row_index, 1, "wrapped to row 0 then advanced by one");

    let bodies = sink.received_bodies().await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[1]["data"], serde_json::json!({"v": "1"}), "wrapped to the first row");
}
