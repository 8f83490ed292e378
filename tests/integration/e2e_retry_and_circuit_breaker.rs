//! End-to-end: a failing sink drives retries within a single dispatch,
//! and enough consecutive dispatch failures across ticks trips the
//! per-connection circuit breaker, after which dispatch is skipped
//! entirely without another request reaching the sink.

use std::sync::Arc;

use chrono::Utc;
use engine::circuit_breaker::CircuitState;
use engine::device_monitor::DeviceMonitor;
use engine::dispatch::dispatch_device;
use engine::{Engine, EngineConfig};
use engine_proto::DeviceType;
use engine_test_utils::{http_connection, http_device, link, ready_dataset, row, InMemoryBlobStore, InMemoryMetadataStore, MockHttpSink, SinkOutcome};

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_cap_seconds: 0,
        circuit_breaker_failure_threshold: 3,
        circuit_breaker_base_recovery_seconds: 300,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn failed_attempts_retry_up_to_max_retries_then_log_failure() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.transmission_config.max_retries = 3;
    device.transmission_config.retry_on_error = true;
    store.seed_device(device).await;
    store.seed_dataset(ready_dataset("ds-1", "rows.csv")).await;
    store.seed_link(link("dev-1", "ds-1", Utc::now())).await;
    blobs.seed("rows.csv", vec![row(&[("v", "1")])]).await;

    sink.push_failures(3, 500).await;

    let engine = Engine::new(fast_config(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;
    let runtime = engine.devices.get("dev-1").await.expect("adopted");

    dispatch_device(&engine, &runtime).await;

    assert_eq!(sink.request_count(), 3, "every retry attempt reaches the sink");
    let logs = store.logs().await;
    assert_eq!(logs.len(), 3, "one log row per attempt");
    assert!(logs.iter().all(|l| matches!(l.status, engine_proto::LogStatus::Failed)));
    assert_eq!(logs[2].retry_count, 2, "zero-based retry count on the final attempt");

    let persisted = store.device("dev-1").await.unwrap();
    assert_eq!(persisted.current_row_index, 0, "no success means no row-index advance");
}

#[tokio::test]
async fn consecutive_failures_trip_the_circuit_breaker_and_skip_further_dispatch() {
    let sink = MockHttpSink::start().await;
    let store = Arc::new(InMemoryMetadataStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());

    store.seed_connection(http_connection("conn-1", &sink.endpoint_url())).await;
    let mut device = http_device("dev-1", "conn-1", DeviceType::Sensor);
    device.transmission_config.max_retries = 1;
    device.transmission_config.retry_on_error = false;
    store.seed_device(device).await;
    store.seed_dataset(ready_dataset("ds-1", "rows.csv")).await;
    store.seed_link(link("dev-1", "ds-1", Utc::now())).await;
    blobs.seed("rows.csv", vec![row(&[("v", "1")])]).await;

    // Threshold is 3 consecutive failures; script enough failing
    // responses to cover 3 single-attempt dispatches.
    sink.push_failures(3, 503).await;

    let engine = Engine::new(fast_config(), store.clone(), blobs.clone());
    DeviceMonitor::new(engine.clone()).reconcile_once().await;
    let runtime = engine.devices.get("dev-1").await.expect("adopted");

    dispatch_device(&engine, &runtime).await;
    dispatch_device(&engine, &runtime).await;
    dispatch_device(&engine, &runtime).await;

    assert_eq!(sink.request_count(), 3);
    let snapshot = engine.breakers.snapshot("conn-1").await.expect("breaker created on first failure");
    assert_eq!(snapshot.state, CircuitState::Open);

    // A fourth dispatch is skipped at the `can_execute` gate: no new
    // request reaches the sink, and consecutive_error_count is untouched.
    dispatch_device(&engine, &runtime).await;
    assert_eq!(sink.request_count(), 3, "circuit open: dispatch short-circuits before publishing");
}
