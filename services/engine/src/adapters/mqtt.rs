//! MQTT protocol adapter: TCP, TLS, and WebSocket transport, inferred
//! from the broker URL scheme, built on `rumqttc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use engine_proto::{categorize_error, sanitize_error_message, ErrorCode, PublishResult};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::broadcast;
use tracing::warn;

use super::{AdapterError, PooledHandle, ProtocolAdapter};

struct ParsedBrokerUrl {
    host: String,
    port: u16,
    is_websocket: bool,
    use_tls: bool,
}

/// Mirrors `mqtt_handler.py::_parse_broker_url`: infer transport and
/// default port from the URL scheme, falling back to `mqtt://` when the
/// URL carries no scheme at all.
fn parse_broker_url(config: &serde_json::Value) -> Result<ParsedBrokerUrl, String> {
    let broker_url = config.get("broker_url").and_then(|v| v.as_str()).unwrap_or_default();
    if broker_url.is_empty() {
        return Err("empty broker URL".to_owned());
    }
    let normalized = if broker_url.contains("://") {
        broker_url.to_owned()
    } else {
        format!("mqtt://{broker_url}")
    };
    let url = url::Url::parse(&normalized).map_err(|e| e.to_string())?;
    let host = url
        .host_str()
        .ok_or_else(|| format!("no host in URL: {broker_url}"))?
        .to_owned();
    let scheme = url.scheme().to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "ws" => 80,
        "wss" => 443,
        "mqtts" => 8883,
        _ => 1883,
    };
    let config_port = url.port().or_else(|| config.get("port").and_then(serde_json::Value::as_u64).map(|p| p as u16));
    let port = config_port.unwrap_or(default_port);
    let is_websocket = matches!(scheme.as_str(), "ws" | "wss");
    let use_tls = config.get("use_tls").and_then(serde_json::Value::as_bool).unwrap_or(false)
        || matches!(scheme.as_str(), "mqtts" | "wss");
    Ok(ParsedBrokerUrl { host, port, is_websocket, use_tls })
}

fn qos_of(config: &serde_json::Value) -> QoS {
    match config.get("qos").and_then(serde_json::Value::as_u64).unwrap_or(1) {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// A live MQTT client plus its background event-loop driver. Cloning
/// shares both the client and the driver's abort handle so multiple
/// dispatchers can use the same pool entry's client handle concurrently.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    acks: broadcast::Sender<()>,
    driver: tokio::task::AbortHandle,
}

impl MqttHandle {
    async fn connect(config: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed = parse_broker_url(config).map_err(AdapterError::Connect)?;

        let client_id = config
            .get("client_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("iot_devsim_{}", uuid::Uuid::new_v4()));

        let mut opts = MqttOptions::new(client_id, parsed.host.clone(), parsed.port);
        opts.set_keep_alive(Duration::from_secs(60));

        if let Some(username) = config.get("username").and_then(|v| v.as_str()) {
            let password = config.get("password").and_then(|v| v.as_str()).unwrap_or_default();
            opts.set_credentials(username, password);
        }

        if parsed.use_tls {
            let verify_ssl = config.get("verify_ssl").and_then(serde_json::Value::as_bool).unwrap_or(true);
            let tls_config = rumqttc::TlsConfiguration::Rustls(Arc::new(super::tls::client_config(verify_ssl)));
            if parsed.is_websocket {
                opts.set_transport(Transport::Wss(tls_config));
            } else {
                opts.set_transport(Transport::Tls(tls_config));
            }
        } else if parsed.is_websocket {
            opts.set_transport(Transport::Ws);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let (acks_tx, _) = broadcast::channel(64);

        let connected_for_driver = connected.clone();
        let acks_for_driver = acks_tx.clone();
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected_for_driver.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                        let _ = acks_for_driver.send(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error");
                        connected_for_driver.store(false, Ordering::SeqCst);
                    }
                }
            }
        });

        let handle = Self {
            client,
            connected,
            acks: acks_tx,
            driver: driver.abort_handle(),
        };

        let deadline = Instant::now() + Duration::from_secs(15);
        while !handle.connected.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                handle.driver.abort();
                return Err(AdapterError::Connect("MQTT connection timed out".to_owned()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(handle)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        let _ = self.client.disconnect().await;
        self.driver.abort();
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), String> {
        let mut acks = self.acks.subscribe();
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| e.to_string())?;
        if qos != QoS::AtMostOnce {
            // A timeout here is not fatal, the publish call already succeeded.
            let _ = tokio::time::timeout(Duration::from_secs(5), acks.recv()).await;
        }
        Ok(())
    }
}

pub struct MqttAdapter;

#[async_trait]
impl ProtocolAdapter for MqttAdapter {
    async fn publish(
        &self,
        config: &serde_json::Value,
        topic: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();

        let handle = match tokio::time::timeout(timeout, MqttHandle::connect(config)).await {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => return connect_failure(&e, start, now),
            Err(_) => {
                return PublishResult::failure(ErrorCode::Timeout.to_string(), "connection timed out", elapsed_ms(start), now)
            }
        };

        let qos = qos_of(config);
        let retain = config.get("retain").and_then(serde_json::Value::as_bool).unwrap_or(false);
        let result = publish_and_report(&handle, topic, qos, retain, payload, start, now).await;
        handle.close().await;
        result
    }

    async fn publish_pooled(
        &self,
        handle: &PooledHandle,
        config: &serde_json::Value,
        topic: &str,
        payload: &[u8],
        _timeout: Duration,
    ) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();
        let PooledHandle::Mqtt(handle) = handle else {
            return PublishResult::failure(ErrorCode::PublishError.to_string(), "not an MQTT handle", elapsed_ms(start), now);
        };
        let qos = qos_of(config);
        let retain = config.get("retain").and_then(serde_json::Value::as_bool).unwrap_or(false);
        publish_and_report(handle, topic, qos, retain, payload, start, now).await
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        config.get("broker_url").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty())
            && config.get("topic").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty())
            && parse_broker_url(config).is_ok()
    }

    async fn connect_pooled(&self, config: &serde_json::Value) -> Result<PooledHandle, AdapterError> {
        MqttHandle::connect(config).await.map(PooledHandle::Mqtt)
    }
}

async fn publish_and_report(
    handle: &MqttHandle,
    topic: &str,
    qos: QoS,
    retain: bool,
    payload: &[u8],
    start: Instant,
    now: chrono::DateTime<chrono::Utc>,
) -> PublishResult {
    match handle.publish(topic, qos, retain, payload).await {
        Ok(()) => {
            let mut r = PublishResult::success("message published successfully", elapsed_ms(start), now);
            r.details.insert("protocol".into(), "mqtt".into());
            r.details.insert("topic".into(), topic.into());
            r
        }
        Err(e) => {
            let code = categorize_error(&e);
            PublishResult::failure(code.to_string(), sanitize_error_message(&e), elapsed_ms(start), now)
        }
    }
}

fn connect_failure(e: &AdapterError, start: Instant, now: chrono::DateTime<chrono::Utc>) -> PublishResult {
    let msg = e.to_string();
    let code = categorize_error(&msg);
    PublishResult::failure(code.to_string(), sanitize_error_message(&msg), elapsed_ms(start), now)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host_as_plain_mqtt() {
        let cfg = serde_json::json!({"broker_url": "broker.local"});
        let parsed = parse_broker_url(&cfg).unwrap();
        assert_eq!(parsed.host, "broker.local");
        assert_eq!(parsed.port, 1883);
        assert!(!parsed.is_websocket);
    }

    #[test]
    fn wss_scheme_implies_websocket_and_tls() {
        let cfg = serde_json::json!({"broker_url": "wss://broker.local/mqtt"});
        let parsed = parse_broker_url(&cfg).unwrap();
        assert_eq!(parsed.port, 443);
        assert!(parsed.is_websocket);
        assert!(parsed.use_tls);
    }

    #[test]
    fn mqtts_scheme_defaults_to_8883() {
        let cfg = serde_json::json!({"broker_url": "mqtts://broker.local"});
        let parsed = parse_broker_url(&cfg).unwrap();
        assert_eq!(parsed.port, 8883);
        assert!(parsed.use_tls);
        assert!(!parsed.is_websocket);
    }

    #[test]
    fn explicit_port_overrides_scheme_default() {
        let cfg = serde_json::json!({"broker_url": "mqtt://broker.local", "port": 18830});
        let parsed = parse_broker_url(&cfg).unwrap();
        assert_eq!(parsed.port, 18830);
    }

    #[test]
    fn validate_config_requires_broker_url_and_topic() {
        let adapter = MqttAdapter;
        assert!(!adapter.validate_config(&serde_json::json!({})));
        assert!(!adapter.validate_config(&serde_json::json!({"broker_url": "mqtt://x"})));
        assert!(adapter.validate_config(&serde_json::json!({"broker_url": "mqtt://x", "topic": "iot/data"})));
    }
}
