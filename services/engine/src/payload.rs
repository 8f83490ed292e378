//! Payload builder: a pure function of `(device state, batch,
//! starting index, wall-clock)` — swapping wall-clock for a fixed value
//! yields byte-identical serialised output, which the e2e tests in the
//! root crate rely on.

use engine_proto::indexmap_compat::IndexMap;
use engine_proto::DeviceType;
use serde_json::{json, Value};

use crate::device_runtime::RuntimeDeviceState;

/// Build the JSON payload for one dispatch:
/// - `include_device_id` adds `"device_id"`.
/// - `include_timestamp` adds `"timestamp"` (ISO-8601 UTC).
/// - A datalogger batch of more than one row uses the `"batch"` shape;
///   every other case (including a datalogger with `batch_size == 1`)
///   uses the single-row `"data"` shape.
pub fn build_payload(
    device: &RuntimeDeviceState,
    batch: &[IndexMap],
    starting_row_index: u64,
    now: chrono::DateTime<chrono::Utc>,
) -> Value {
    let mut obj = serde_json::Map::new();

    if device.include_device_id.load(std::sync::atomic::Ordering::SeqCst) {
        obj.insert("device_id".to_owned(), json!(device.device_ref));
    }
    if device.include_timestamp.load(std::sync::atomic::Ordering::SeqCst) {
        obj.insert("timestamp".to_owned(), json!(now.to_rfc3339()));
    }

    if device.device_type == DeviceType::Datalogger && batch.len() > 1 {
        let entries: Vec<Value> = batch
            .iter()
            .enumerate()
            .map(|(offset, row)| {
                json!({
                    "row": starting_row_index + offset as u64,
                    "data": row.to_json_object(),
                })
            })
            .collect();
        obj.insert("batch".to_owned(), Value::Array(entries));
    } else if let Some(row) = batch.first() {
        obj.insert("data".to_owned(), row.to_json_object());
    }

    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use engine_proto::{Device, DeviceStatus, TransmissionConfig};

    fn row(pairs: &[(&str, &str)]) -> IndexMap {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), json!(v))).collect()
    }

    fn state(device_type: DeviceType, include_device_id: bool, include_timestamp: bool) -> RuntimeDeviceState {
        let device = Device {
            id: "dev-1".into(),
            device_ref: "DEV00001".into(),
            device_type,
            connection_id: Some("conn-1".into()),
            project_id: None,
            transmission_enabled: true,
            transmission_frequency_seconds: 1,
            transmission_config: TransmissionConfig {
                batch_size: 2,
                include_device_id,
                include_timestamp,
                ..TransmissionConfig::default()
            },
            current_row_index: 0,
            status: DeviceStatus::Idle,
            last_transmission_at: None,
            is_active: true,
            is_deleted: false,
        };
        RuntimeDeviceState::new(&device, "conn-1".into(), vec![])
    }

    fn fixed_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn sensor_single_row_shape() {
        let s = state(DeviceType::Sensor, true, false);
        let batch = vec![row(&[("v", "10")])];
        let payload = build_payload(&s, &batch, 0, fixed_now());
        assert_eq!(
            payload,
            json!({"device_id": "DEV00001", "data": {"v": "10"}})
        );
    }

    #[test]
    fn datalogger_batch_of_one_uses_data_shape_not_batch() {
        let s = state(DeviceType::Datalogger, true, false);
        let batch = vec![row(&[("x", "1")])];
        let payload = build_payload(&s, &batch, 0, fixed_now());
        assert_eq!(payload, json!({"device_id": "DEV00001", "data": {"x": "1"}}));
    }

    #[test]
    fn datalogger_batch_of_two_uses_batch_shape_with_absolute_row_indices() {
        let s = state(DeviceType::Datalogger, true, false);
        let batch = vec![row(&[("x", "1")]), row(&[("x", "2")])];
        let payload = build_payload(&s, &batch, 2, fixed_now());
        assert_eq!(
            payload,
            json!({
                "device_id": "DEV00001",
                "batch": [
                    {"row": 2, "data": {"x": "1"}},
                    {"row": 3, "data": {"x": "2"}},
                ],
            })
        );
    }

    #[test]
    fn timestamp_included_when_configured() {
        let s = state(DeviceType::Sensor, false, true);
        let batch = vec![row(&[("v", "1")])];
        let payload = build_payload(&s, &batch, 0, fixed_now());
        assert_eq!(payload["timestamp"], json!("2026-01-01T00:00:00+00:00"));
        assert!(payload.get("device_id").is_none());
    }

    #[test]
    fn payload_building_is_pure_given_a_fixed_clock() {
        let s = state(DeviceType::Sensor, true, true);
        let batch = vec![row(&[("v", "1")])];
        let a = build_payload(&s, &batch, 0, fixed_now());
        let b = build_payload(&s, &batch, 0, fixed_now());
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }
}
