//! Dispatch: the per-device, per-tick transmit routine, and the pause
//! path at end-of-dataset — a free function over the shared `Engine`
//! handles rather than a stateful manager object.
//!
//! Every error this module can hit is caught and logged; a single
//! device's dispatch failing never propagates past `dispatch_device`,
//! so the scheduler's tick loop never dies from one bad device.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use engine_proto::{DeviceStatus, PublishResult};
use tracing::{error, warn};

use crate::adapters::{adapter_for, resolve_topic_or_endpoint};
use crate::device_runtime::RuntimeDeviceState;
use crate::store::DeviceProgressUpdate;
use crate::Engine;

/// Run one dispatch for `device`. The in-flight flag must already
/// be held by the caller (the Scheduler) and is released by the caller
/// on every exit path, including this function returning early.
pub async fn dispatch_device(engine: &Engine, device: &Arc<RuntimeDeviceState>) {
    let rows = device.dataset_rows.read().await.clone();
    if rows.is_empty() {
        return;
    }

    let row_count = rows.len() as u64;
    let mut starting_index = device.current_row_index.load(Ordering::SeqCst);

    let auto_reset = device.auto_reset.load(Ordering::SeqCst);
    if starting_index >= row_count {
        if auto_reset {
            starting_index = 0;
            device.current_row_index.store(0, Ordering::SeqCst);
        } else {
            pause_device(engine, device).await;
            return;
        }
    }

    if !engine.breakers.can_execute(&device.connection_id).await {
        return;
    }

    let batch_size = device.batch_size.load(Ordering::SeqCst);
    let end = (starting_index + u64::from(batch_size)).min(row_count);
    let batch: Vec<_> = rows[starting_index as usize..end as usize].to_vec();
    if batch.is_empty() {
        return;
    }

    let Some((protocol, raw_config)) = (match engine.cache.get_connection(&device.connection_id, engine.store.as_ref(), &engine.stats).await {
        Ok(v) => v,
        Err(e) => {
            error!(device_id = %device.device_id, error = %e, "failed to fetch connection config");
            return;
        }
    }) else {
        error!(device_id = %device.device_id, connection_id = %device.connection_id, "connection not found");
        return;
    };

    let config = engine.crypto.decrypt_config(&raw_config);
    let adapter = adapter_for(protocol);
    let topic = resolve_topic_or_endpoint(protocol, &config, None);
    let timeout = engine.config.publish_timeout();

    let payload = crate::payload::build_payload(device, &batch, starting_index, chrono::Utc::now());
    let payload_bytes = serde_json::to_vec(&payload).unwrap_or_default();

    let pooled = engine
        .pool
        .acquire(&device.connection_id, protocol, &config, adapter.connect_pooled(&config))
        .await
        .ok();

    let attempts = publish_with_retry(
        engine,
        device,
        adapter.as_ref(),
        pooled.as_ref(),
        &config,
        &topic,
        &payload_bytes,
        timeout,
    )
    .await;

    let mut logs = Vec::with_capacity(attempts.len());
    let mut any_success = false;
    let mut threshold_breached = false;

    for (i, result) in attempts.iter().enumerate() {
        let retries_used = i as u32;
        if result.success {
            any_success = true;
            device.consecutive_error_count.store(0, Ordering::SeqCst);
            engine.breakers.record_success(&device.connection_id).await;
        } else {
            engine.breakers.record_failure(&device.connection_id).await;
            let count = device.consecutive_error_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= device.max_retries.load(Ordering::SeqCst) {
                threshold_breached = true;
            }
        }

        let breaker_snapshot = engine.breakers.snapshot(&device.connection_id).await;
        let log = crate::log_writer::build_log_record(
            device,
            protocol,
            &topic,
            &payload,
            result,
            starting_index,
            retries_used,
            breaker_snapshot,
            engine.config.log_message_content,
            pooled.is_some(),
        );
        logs.push(log);

        engine
            .stats
            .record_publish(protocol.as_str(), result.success, Duration::from_millis(result.latency_ms), payload_bytes.len() as u64);
    }

    if threshold_breached {
        engine.pool.invalidate(&device.connection_id).await;
    }

    let mut update = DeviceProgressUpdate::new(device.device_id.clone());
    update.last_transmission_at = Some(chrono::Utc::now());

    if any_success {
        let new_index = starting_index + batch.len() as u64;
        device.current_row_index.store(new_index, Ordering::SeqCst);
        update.current_row_index = Some(new_index);
        update.status = Some(DeviceStatus::Transmitting);

        if new_index >= row_count && !auto_reset {
            update.status = Some(DeviceStatus::Idle);
            update.transmission_enabled = Some(false);
        }
    } else {
        update.status = Some(DeviceStatus::Error);
    }

    if let Err(e) = engine.store.commit_dispatch(update, &logs).await {
        error!(device_id = %device.device_id, error = %e, "failed to commit dispatch; row-index advance discarded");
    }
}

/// Publish-with-retry: up to `max_retries` attempts if
/// `retry_on_error`, else a single attempt. Sleeps `min(2^i, cap)`
/// seconds between attempts, `i` the zero-based count of attempts
/// already made. Returns every attempt's result in order.
async fn publish_with_retry(
    engine: &Engine,
    device: &RuntimeDeviceState,
    adapter: &dyn crate::adapters::ProtocolAdapter,
    pooled: Option<&crate::adapters::PooledHandle>,
    config: &serde_json::Value,
    topic: &str,
    payload: &[u8],
    timeout: Duration,
) -> Vec<PublishResult> {
    let max_attempts = if device.retry_on_error.load(Ordering::SeqCst) {
        device.max_retries.load(Ordering::SeqCst).max(1)
    } else {
        1
    };
    let backoff_cap = engine.config.retry_backoff_cap_seconds;
    let mut results = Vec::with_capacity(max_attempts as usize);

    for i in 0..max_attempts {
        let result = match pooled {
            Some(handle) => adapter.publish_pooled(handle, config, topic, payload, timeout).await,
            None => adapter.publish(config, topic, payload, timeout).await,
        };
        let succeeded = result.success;
        results.push(result);
        if succeeded {
            break;
        }
        if i + 1 < max_attempts {
            let delay = Duration::from_secs(2u64.saturating_pow(i).min(backoff_cap));
            tokio::time::sleep(delay).await;
        }
    }
    results
}

/// Pause: end-of-dataset with no auto-reset. Writes
/// `transmission_enabled=false, status=idle` and removes the runtime
/// state without touching `current_row_index`.
pub async fn pause_device(engine: &Engine, device: &Arc<RuntimeDeviceState>) {
    if let Err(e) = engine.store.pause_device(&device.device_id).await {
        warn!(device_id = %device.device_id, error = %e, "failed to persist pause");
        return;
    }
    engine.devices.remove(&device.device_id).await;
}
