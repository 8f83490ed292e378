//! Domain types shared across the transmission engine.
//!
//! This crate carries no I/O: entities mirrored from the metadata store,
//! the protocol adapter contract (`PublishResult`, error codes), the
//! control-plane callback DTOs, and the error message sanitiser that
//! every adapter must apply before a message reaches logs or responses.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Http,
    Https,
    Kafka,
}

impl Protocol {
    /// Case-insensitive parse, mirroring how the metadata store stores the
    /// protocol as a free-form string column.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Some(Self::Mqtt),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "kafka" => Some(Self::Kafka),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Http => "http",
            Self::Https => "https",
            Self::Kafka => "kafka",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Sensor,
    Datalogger,
}

impl DeviceType {
    /// `device_type` is case-insensitive downstream but stored as provided.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sensor" => Some(Self::Sensor),
            "datalogger" => Some(Self::Datalogger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Idle,
    Transmitting,
    Paused,
    Error,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Transmitting => "transmitting",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Csv,
    Tsv,
    Json,
}

impl DatasetFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// `connections` row. The engine reads this; it never writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub protocol: Protocol,
    /// Raw config map as stored; sensitive fields may be encrypted. Opaque
    /// to everything except the protocol-specific config structs and the
    /// best-effort decrypt helper.
    pub config: Value,
    pub is_deleted: bool,
}

/// Per-device transmission knobs (`devices.transmission_config` JSON column).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransmissionConfig {
    pub batch_size: u32,
    pub auto_reset: bool,
    pub include_device_id: bool,
    pub include_timestamp: bool,
    pub jitter_ms: u32,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            auto_reset: false,
            include_device_id: true,
            include_timestamp: true,
            jitter_ms: 0,
            retry_on_error: true,
            max_retries: 3,
        }
    }
}

/// `devices` row. The engine reads configuration and writes
/// `current_row_index`, `status`, `last_transmission_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_ref: String,
    pub device_type: DeviceType,
    pub connection_id: Option<String>,
    pub project_id: Option<String>,
    pub transmission_enabled: bool,
    pub transmission_frequency_seconds: u32,
    pub transmission_config: TransmissionConfig,
    pub current_row_index: u64,
    pub status: DeviceStatus,
    pub last_transmission_at: Option<chrono::DateTime<chrono::Utc>>,
    pub is_active: bool,
    pub is_deleted: bool,
}

impl Device {
    /// Devices eligible for the monitor to adopt.
    pub fn qualifies_for_transmission(&self) -> bool {
        !self.is_deleted && self.is_active && self.transmission_enabled && self.connection_id.is_some()
    }
}

/// `datasets` row. The engine reads `file_path`/`file_format`; never writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub file_path: String,
    pub file_format: DatasetFormat,
    pub row_count: u64,
    pub status: String,
}

impl Dataset {
    pub fn is_ready(&self) -> bool {
        self.status.eq_ignore_ascii_case("ready")
    }
}

/// `device_datasets` link row. Ordering is by `linked_at` ascending, then
/// `dataset_id` as a tiebreaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDatasetLink {
    pub device_id: String,
    pub dataset_id: String,
    pub config: Value,
    pub linked_at: chrono::DateTime<chrono::Utc>,
}

/// One decoded dataset row: an ordered key/value map (insertion order
/// preserved, matching CSV column order / JSON object key order).
pub type RowMap = indexmap_compat::IndexMap;

/// `transmission_logs` row. Append-only; the engine writes only, never reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmissionLogRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub project_id: Option<String>,
    pub device_id: String,
    pub connection_id: Option<String>,
    pub message_type: String,
    pub direction: Direction,
    pub payload_size: u64,
    pub message_content: Option<Value>,
    pub protocol: Protocol,
    pub topic: Option<String>,
    pub status: LogStatus,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub is_simulated: bool,
    pub metadata: LogMetadata,
}

/// The `metadata` JSON column of a transmission log row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogMetadata {
    pub row_index: u64,
    pub batch_size: u32,
    pub pooled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_total_failures: Option<u64>,
}

// ---------------------------------------------------------------------------
// Protocol adapter contract
// ---------------------------------------------------------------------------

/// Result of one publish attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl PublishResult {
    pub fn success(message: impl Into<String>, latency_ms: u64, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            success: true,
            message: message.into(),
            latency_ms,
            timestamp: now,
            message_id: None,
            details: BTreeMap::new(),
            error_code: None,
        }
    }

    pub fn failure(
        error_code: impl Into<String>,
        message: impl Into<String>,
        latency_ms: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let raw = message.into();
        Self {
            success: false,
            message: sanitize_error_message(&raw),
            latency_ms,
            timestamp: now,
            message_id: None,
            details: BTreeMap::new(),
            error_code: Some(error_code.into()),
        }
    }
}

/// Frozen v1 error codes. `Http(status)` renders as `HTTP_<status>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    ConnectionRefused,
    HostNotFound,
    AuthenticationFailed,
    SslError,
    NetworkError,
    Http(u16),
    KafkaError,
    PublishError,
    UnexpectedError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::ConnectionRefused => write!(f, "CONNECTION_REFUSED"),
            Self::HostNotFound => write!(f, "HOST_NOT_FOUND"),
            Self::AuthenticationFailed => write!(f, "AUTHENTICATION_FAILED"),
            Self::SslError => write!(f, "SSL_ERROR"),
            Self::NetworkError => write!(f, "NETWORK_ERROR"),
            Self::Http(status) => write!(f, "HTTP_{status}"),
            Self::KafkaError => write!(f, "KAFKA_ERROR"),
            Self::PublishError => write!(f, "PUBLISH_ERROR"),
            Self::UnexpectedError => write!(f, "UNEXPECTED_ERROR"),
        }
    }
}

/// The case-insensitive substrings that, if present in an error message,
/// force a generic replacement before the message reaches logs/responses.
const SENSITIVE_PATTERNS: [&str; 6] = ["password", "token", "key", "secret", "credential", "auth"];

/// Replace any error message containing a sensitive substring with a
/// generic message, preserving the structured error code separately.
pub fn sanitize_error_message(message: &str) -> String {
    let lower = message.to_ascii_lowercase();
    if SENSITIVE_PATTERNS.iter().any(|pat| lower.contains(pat)) {
        "authentication or configuration error".to_owned()
    } else {
        message.to_owned()
    }
}

/// Best-effort categorisation of a raw adapter error string into one of the
/// frozen codes, used by adapters whose underlying client surfaces only a
/// string/kind and not a structured error. Mirrors
/// `transmission-service/.../protocols/base.py::_get_error_code`.
pub fn categorize_error(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorCode::Timeout
    } else if lower.contains("connection refused") {
        ErrorCode::ConnectionRefused
    } else if lower.contains("not found") || lower.contains("unknown") || lower.contains("resolve") {
        ErrorCode::HostNotFound
    } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
        ErrorCode::SslError
    } else if lower.contains("auth") || lower.contains("unauthorized") {
        ErrorCode::AuthenticationFailed
    } else if lower.contains("network")
        || lower.contains("reset by peer")
        || lower.contains("broken pipe")
        || lower.contains("unreachable")
    {
        ErrorCode::NetworkError
    } else {
        ErrorCode::PublishError
    }
}

// ---------------------------------------------------------------------------
// Control-plane callback DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reset_row_index: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAck {
    pub accepted: bool,
}

/// A minimal ordered map, kept separate from `serde_json::Map` (which is
/// itself order-preserving when the `preserve_order` feature is off by
/// default upstream) so dataset rows have an explicit, documented
/// ordering contract independent of `serde_json`'s feature flags.
pub mod indexmap_compat {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct IndexMap(Vec<(String, Value)>);

    impl IndexMap {
        pub fn new() -> Self {
            Self(Vec::new())
        }

        pub fn insert(&mut self, key: impl Into<String>, value: Value) {
            let key = key.into();
            if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
            } else {
                self.0.push((key, value));
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
            self.0.iter().map(|(k, v)| (k.as_str(), v))
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        pub fn get(&self, key: &str) -> Option<&Value> {
            self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
        }

        /// Convert to a `serde_json::Value::Object`, preserving insertion
        /// order (`serde_json`'s `Map` preserves insertion order when built
        /// incrementally, independent of the `preserve_order` feature).
        pub fn to_json_object(&self) -> Value {
            let mut map = serde_json::Map::with_capacity(self.0.len());
            for (k, v) in &self.0 {
                map.insert(k.clone(), v.clone());
            }
            Value::Object(map)
        }
    }

    impl FromIterator<(String, Value)> for IndexMap {
        fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
            let mut m = IndexMap::new();
            for (k, v) in iter {
                m.insert(k, v);
            }
            m
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_password_mentions() {
        let msg = sanitize_error_message("Connection failed: invalid password for user root");
        assert_eq!(msg, "authentication or configuration error");
    }

    #[test]
    fn sanitizes_is_case_insensitive() {
        let msg = sanitize_error_message("Bad AUTH Token supplied");
        assert_eq!(msg, "authentication or configuration error");
    }

    #[test]
    fn leaves_unrelated_messages_untouched() {
        let msg = sanitize_error_message("connection refused by peer");
        assert_eq!(msg, "connection refused by peer");
    }

    #[test]
    fn categorizes_timeout() {
        assert_eq!(categorize_error("operation timed out after 30s"), ErrorCode::Timeout);
    }

    #[test]
    fn categorizes_connection_refused() {
        assert_eq!(
            categorize_error("Connection refused (os error 111)"),
            ErrorCode::ConnectionRefused
        );
    }

    #[test]
    fn categorizes_generic_network_issues_distinctly_from_publish_error() {
        assert_eq!(categorize_error("network unreachable"), ErrorCode::NetworkError);
        assert_eq!(categorize_error("connection reset by peer"), ErrorCode::NetworkError);
        assert_eq!(categorize_error("something else entirely"), ErrorCode::PublishError);
    }

    #[test]
    fn http_error_code_renders_with_status() {
        assert_eq!(ErrorCode::Http(404).to_string(), "HTTP_404");
    }

    #[test]
    fn device_qualifies_requires_connection_and_flags() {
        let mut d = sample_device();
        assert!(d.qualifies_for_transmission());
        d.connection_id = None;
        assert!(!d.qualifies_for_transmission());
    }

    fn sample_device() -> Device {
        Device {
            id: "dev-1".into(),
            device_ref: "DEV00001".into(),
            device_type: DeviceType::Sensor,
            connection_id: Some("conn-1".into()),
            project_id: None,
            transmission_enabled: true,
            transmission_frequency_seconds: 1,
            transmission_config: TransmissionConfig::default(),
            current_row_index: 0,
            status: DeviceStatus::Idle,
            last_transmission_at: None,
            is_active: true,
            is_deleted: false,
        }
    }
}
