//! Protocol adapter contract: one variant per wire protocol,
//! dispatched by a closed sum type rather than inheritance.

pub mod http;
pub mod kafka;
pub mod mqtt;
mod tls;

use std::time::Duration;

use async_trait::async_trait;
use engine_proto::{Protocol, PublishResult};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("unsupported protocol: {0}")]
    Unsupported(String),
}

/// A live, poolable handle to a protocol client. Cloning shares the
/// underlying client (all three wrapped clients are cheap-clone handles
/// over a shared connection/loop) so multiple dispatchers can use the
/// same pool entry's client handle concurrently.
#[derive(Clone)]
pub enum PooledHandle {
    Mqtt(mqtt::MqttHandle),
    Http(http::HttpHandle),
    Kafka(kafka::KafkaHandle),
    #[doc(hidden)]
    Test(std::sync::Arc<std::sync::atomic::AtomicBool>),
}

impl PooledHandle {
    pub async fn close(&self) {
        match self {
            Self::Mqtt(h) => h.close().await,
            Self::Http(_) => {}
            Self::Kafka(_) => {}
            Self::Test(closed) => closed.store(true, std::sync::atomic::Ordering::SeqCst),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self {
            Self::Mqtt(h) => h.is_connected(),
            Self::Http(_) => true,
            Self::Kafka(h) => h.is_healthy().await,
            Self::Test(closed) => !closed.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    pub fn test_handle() -> Self {
        Self::Test(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)))
    }
}

/// Contract implemented by each protocol variant.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// One-shot path: opens, uses, and closes a transient handle. Always
    /// available as a fallback when pool acquisition fails.
    async fn publish(
        &self,
        config: &serde_json::Value,
        topic_or_endpoint: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> PublishResult;

    /// Use an existing pooled handle; must not close it.
    async fn publish_pooled(
        &self,
        handle: &PooledHandle,
        config: &serde_json::Value,
        topic_or_endpoint: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> PublishResult;

    /// Schema-and-format check only; no I/O.
    fn validate_config(&self, config: &serde_json::Value) -> bool;

    /// Open a handle suitable for pooling.
    async fn connect_pooled(&self, config: &serde_json::Value) -> Result<PooledHandle, AdapterError>;
}

/// Resolve the adapter for a protocol.
pub fn adapter_for(protocol: Protocol) -> Box<dyn ProtocolAdapter> {
    match protocol {
        Protocol::Mqtt => Box::new(mqtt::MqttAdapter),
        Protocol::Http | Protocol::Https => Box::new(http::HttpAdapter),
        Protocol::Kafka => Box::new(kafka::KafkaAdapter),
    }
}

/// Topic/endpoint selection:
/// - MQTT: `config.topic`, fallback `"iot/data"`.
/// - HTTP/HTTPS: `config.endpoint_url`, overridable by an absolute `topic`.
/// - Kafka: `config.topic`.
pub fn resolve_topic_or_endpoint(protocol: Protocol, config: &serde_json::Value, topic_override: Option<&str>) -> String {
    match protocol {
        Protocol::Mqtt | Protocol::Kafka => config
            .get("topic")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| "iot/data".to_owned()),
        Protocol::Http | Protocol::Https => {
            if let Some(t) = topic_override {
                if t.starts_with("http://") || t.starts_with("https://") {
                    return t.to_owned();
                }
            }
            let base = config
                .get("endpoint_url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim_end_matches('/');
            match topic_override {
                Some(t) if !t.is_empty() => format!("{base}/{}", t.trim_start_matches('/')),
                _ => base.to_owned(),
            }
        }
    }
}
