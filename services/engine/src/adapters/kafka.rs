//! Kafka protocol adapter: producer defaults, `message_id` format, and
//! a `partitions_for("__consumer_offsets")` health probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use engine_proto::{categorize_error, sanitize_error_message, ErrorCode, PublishResult};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;

use super::{AdapterError, PooledHandle, ProtocolAdapter};

/// `acks` accepts `0`, `1`, `"all"`, or a numeric string, coerced to
/// whatever string `librdkafka`'s `acks` option expects.
fn acks_of(config: &serde_json::Value) -> String {
    match config.get("acks") {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("all") => "all".to_owned(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => "all".to_owned(),
    }
}

/// `bootstrap_servers` accepts a plain string or a JSON array of
/// strings, joined with `,` into the form `bootstrap.servers` expects.
fn bootstrap_servers_of(config: &serde_json::Value) -> Option<String> {
    match config.get("bootstrap_servers")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(",");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    }
}

/// Numeric config fields may arrive as either a JSON number or a numeric
/// string; normalise either to the string `librdkafka` expects.
fn coerce_int_str(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => s.parse::<i64>().ok().map(|n| n.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct KafkaHandle {
    producer: std::sync::Arc<FutureProducer>,
}

impl KafkaHandle {
    fn connect(config: &serde_json::Value) -> Result<Self, AdapterError> {
        let brokers = bootstrap_servers_of(config).ok_or_else(|| AdapterError::Connect("missing bootstrap_servers".to_owned()))?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "30000")
            .set("acks", &acks_of(config))
            .set("retries", &config.get("retries").and_then(coerce_int_str).unwrap_or_else(|| "3".to_owned()))
            .set(
                "retry.backoff.ms",
                &config.get("retry_backoff_ms").and_then(coerce_int_str).unwrap_or_else(|| "1000".to_owned()),
            )
            .set("linger.ms", &config.get("linger_ms").and_then(coerce_int_str).unwrap_or_else(|| "20".to_owned()))
            .set(
                "batch.size",
                &config.get("batch_size").and_then(coerce_int_str).unwrap_or_else(|| "65536".to_owned()),
            )
            .set(
                "compression.type",
                config.get("compression").and_then(|v| v.as_str()).unwrap_or("lz4"),
            );

        if let Some(security_protocol) = config.get("security_protocol").and_then(|v| v.as_str()) {
            client_config.set("security.protocol", security_protocol);
        }
        if let Some(username) = config.get("username").and_then(|v| v.as_str()) {
            let password = config.get("password").and_then(|v| v.as_str()).unwrap_or_default();
            client_config
                .set("sasl.mechanisms", config.get("sasl_mechanism").and_then(|v| v.as_str()).unwrap_or("PLAIN"))
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = client_config.create().map_err(|e| AdapterError::Connect(e.to_string()))?;
        Ok(Self {
            producer: std::sync::Arc::new(producer),
        })
    }

    pub async fn is_healthy(&self) -> bool {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.client().fetch_metadata(Some("__consumer_offsets"), Duration::from_secs(5)).is_ok())
            .await
            .unwrap_or(false)
    }

    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8], timeout: Duration) -> Result<String, KafkaError> {
        let mut record = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        match self.producer.send(record, Timeout::After(timeout)).await {
            Ok((partition, offset)) => Ok(format!("{topic}-{partition}-{offset}")),
            Err((err, _)) => Err(err),
        }
    }
}

pub struct KafkaAdapter;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn publish_and_report(handle: &KafkaHandle, config: &serde_json::Value, topic: &str, payload: &[u8], timeout: Duration) -> PublishResult {
    let start = Instant::now();
    let now = chrono::Utc::now();
    let key = config.get("partition_key").and_then(|v| v.as_str());
    match handle.publish(topic, key, payload, timeout).await {
        Ok(message_id) => {
            let mut r = PublishResult::success("message published successfully", elapsed_ms(start), now);
            r.details.insert("protocol".into(), "kafka".into());
            r.message_id = Some(message_id);
            r
        }
        Err(e) => {
            let message = e.to_string();
            let code = categorize_error(&message);
            PublishResult::failure(code.to_string(), sanitize_error_message(&message), elapsed_ms(start), now)
        }
    }
}

#[async_trait]
impl ProtocolAdapter for KafkaAdapter {
    async fn publish(&self, config: &serde_json::Value, topic: &str, payload: &[u8], timeout: Duration) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();
        let handle = match KafkaHandle::connect(config) {
            Ok(h) => h,
            Err(e) => {
                let code = categorize_error(&e.to_string());
                return PublishResult::failure(code.to_string(), sanitize_error_message(&e.to_string()), elapsed_ms(start), now);
            }
        };
        publish_and_report(&handle, config, topic, payload, timeout).await
    }

    async fn publish_pooled(
        &self,
        handle: &PooledHandle,
        config: &serde_json::Value,
        topic: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();
        let PooledHandle::Kafka(handle) = handle else {
            return PublishResult::failure(ErrorCode::PublishError.to_string(), "not a Kafka handle", elapsed_ms(start), now);
        };
        publish_and_report(handle, config, topic, payload, timeout).await
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        bootstrap_servers_of(config).is_some() && config.get("topic").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty())
    }

    async fn connect_pooled(&self, config: &serde_json::Value) -> Result<PooledHandle, AdapterError> {
        KafkaHandle::connect(config).map(PooledHandle::Kafka)
    }
}
