//! Log Writer: turns one publish attempt into a Transmission Log
//! record. Records are accumulated in memory during a dispatch and
//! committed in the same transaction as the device state update; the
//! actual write lives in `MetadataStore::commit_dispatch`.

use engine_proto::{
    Direction, LogMetadata, LogStatus, Protocol, PublishResult, TransmissionLogRecord,
};

use crate::circuit_breaker::BreakerSnapshot;
use crate::device_runtime::RuntimeDeviceState;

/// Build one log record for a single publish attempt. `retries`
/// is the number of retries already used for this row (0 on the first
/// attempt). When `log_message_content` is false, `message_content` is
/// omitted, to keep log storage bounded for large-volume deployments.
#[allow(clippy::too_many_arguments)]
pub fn build_log_record(
    device: &RuntimeDeviceState,
    protocol: Protocol,
    topic: &str,
    payload: &serde_json::Value,
    result: &PublishResult,
    row_index: u64,
    retries: u32,
    breaker: Option<BreakerSnapshot>,
    log_message_content: bool,
    pooled: bool,
) -> TransmissionLogRecord {
    let mut metadata = LogMetadata {
        row_index,
        batch_size: device.batch_size.load(std::sync::atomic::Ordering::SeqCst),
        pooled,
        ..LogMetadata::default()
    };

    if !result.success {
        metadata.error_code = result.error_code.clone();
        metadata.error_message = Some(result.message.clone());
        if !result.details.is_empty() {
            metadata.error_details = Some(serde_json::to_value(&result.details).unwrap_or_default());
        }
        metadata.consecutive_failures = Some(device.consecutive_error_count.load(std::sync::atomic::Ordering::SeqCst));
    }

    if let Some(snap) = breaker {
        metadata.circuit_state = Some(snap.state.as_str().to_owned());
        metadata.circuit_total_failures = Some(snap.total_failures);
    }

    TransmissionLogRecord {
        timestamp: result.timestamp,
        project_id: device.project_id.clone(),
        device_id: device.device_id.clone(),
        connection_id: Some(device.connection_id.clone()),
        message_type: "dataset_row".to_owned(),
        direction: if result.success { Direction::Sent } else { Direction::Failed },
        payload_size: serde_json::to_vec(payload).map(|b| b.len() as u64).unwrap_or(0),
        message_content: log_message_content.then(|| payload.clone()),
        protocol,
        topic: Some(topic.to_owned()),
        status: if result.success { LogStatus::Success } else { LogStatus::Failed },
        latency_ms: result.latency_ms,
        retry_count: retries,
        is_simulated: false,
        metadata,
    }
}
