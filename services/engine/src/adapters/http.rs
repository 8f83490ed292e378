//! HTTP/HTTPS protocol adapter: method dispatch, status-to-error-code
//! mapping, and basic/bearer/API-key auth schemes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use engine_proto::{categorize_error, sanitize_error_message, ErrorCode, PublishResult};
use reqwest::Method;

use super::{AdapterError, PooledHandle, ProtocolAdapter};

#[derive(Clone)]
pub struct HttpHandle {
    client: reqwest::Client,
}

impl HttpHandle {
    fn new() -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AdapterError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

pub struct HttpAdapter;

fn method_of(config: &serde_json::Value) -> Method {
    match config.get("method").and_then(|v| v.as_str()).unwrap_or("POST").to_ascii_uppercase().as_str() {
        "GET" => Method::GET,
        "PUT" => Method::PUT,
        "PATCH" => Method::PATCH,
        "DELETE" => Method::DELETE,
        _ => Method::POST,
    }
}

/// POST/PUT/PATCH carry the JSON body; GET/DELETE carry none.
fn method_has_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Apply whichever auth scheme the config fields indicate: basic auth if
/// `username`+`password` are present, bearer if `bearer_token` is present,
/// API-key header if `api_key_header`+`api_key_value` are present. Schemes
/// are inferred from field presence, not a discriminator field, and are
/// independent — a config naming more than one applies all of them.
fn apply_auth(mut req: reqwest::RequestBuilder, config: &serde_json::Value) -> reqwest::RequestBuilder {
    if let Some(username) = config.get("username").and_then(|v| v.as_str()) {
        let password = config.get("password").and_then(|v| v.as_str());
        req = req.basic_auth(username, password);
    }
    if let Some(token) = config.get("bearer_token").and_then(|v| v.as_str()) {
        req = req.bearer_auth(token);
    }
    if let (Some(header), Some(value)) = (
        config.get("api_key_header").and_then(|v| v.as_str()),
        config.get("api_key_value").and_then(|v| v.as_str()),
    ) {
        req = req.header(header, value);
    }
    req
}

async fn do_publish(client: &reqwest::Client, config: &serde_json::Value, url: &str, payload: &[u8], timeout: Duration) -> PublishResult {
    let start = Instant::now();
    let now = chrono::Utc::now();
    let method = method_of(config);

    let has_body = method_has_body(&method);
    let mut req = client.request(method, url).timeout(timeout);
    if has_body {
        req = req.header("Content-Type", "application/json").body(payload.to_vec());
    }
    req = apply_auth(req, config);

    if let Some(headers) = config.get("headers").and_then(|v| v.as_object()) {
        for (k, v) in headers {
            if let Some(v) = v.as_str() {
                req = req.header(k.as_str(), v);
            }
        }
    }

    match req.send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                let mut r = PublishResult::success("message published successfully", elapsed_ms(start), now);
                r.details.insert("protocol".into(), "http".into());
                r.details.insert("status_code".into(), status.as_u16().into());
                r
            } else {
                let code = ErrorCode::Http(status.as_u16());
                let body = resp.text().await.unwrap_or_default();
                let message = format!("HTTP {} response: {}", status.as_u16(), body);
                PublishResult::failure(code.to_string(), sanitize_error_message(&message), elapsed_ms(start), now)
            }
        }
        Err(e) => {
            let message = e.to_string();
            let code = if e.is_timeout() { ErrorCode::Timeout } else { categorize_error(&message) };
            PublishResult::failure(code.to_string(), sanitize_error_message(&message), elapsed_ms(start), now)
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    async fn publish(&self, config: &serde_json::Value, endpoint: &str, payload: &[u8], timeout: Duration) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();
        let handle = match HttpHandle::new() {
            Ok(h) => h,
            Err(e) => return PublishResult::failure(ErrorCode::UnexpectedError.to_string(), e.to_string(), elapsed_ms(start), now),
        };
        do_publish(&handle.client, config, endpoint, payload, timeout).await
    }

    async fn publish_pooled(
        &self,
        handle: &PooledHandle,
        config: &serde_json::Value,
        endpoint: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> PublishResult {
        let start = Instant::now();
        let now = chrono::Utc::now();
        let PooledHandle::Http(handle) = handle else {
            return PublishResult::failure(ErrorCode::PublishError.to_string(), "not an HTTP handle", elapsed_ms(start), now);
        };
        do_publish(&handle.client, config, endpoint, payload, timeout).await
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        config.get("endpoint_url").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty())
    }

    async fn connect_pooled(&self, _config: &serde_json::Value) -> Result<PooledHandle, AdapterError> {
        HttpHandle::new().map(PooledHandle::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_post_method() {
        let cfg = serde_json::json!({});
        assert_eq!(method_of(&cfg), Method::POST);
    }

    #[test]
    fn honours_configured_put_method() {
        let cfg = serde_json::json!({"method": "put"});
        assert_eq!(method_of(&cfg), Method::PUT);
    }

    #[test]
    fn honours_configured_get_and_delete_methods() {
        assert_eq!(method_of(&serde_json::json!({"method": "get"})), Method::GET);
        assert_eq!(method_of(&serde_json::json!({"method": "DELETE"})), Method::DELETE);
    }

    #[test]
    fn only_post_put_patch_carry_a_body() {
        assert!(method_has_body(&Method::POST));
        assert!(method_has_body(&Method::PUT));
        assert!(method_has_body(&Method::PATCH));
        assert!(!method_has_body(&Method::GET));
        assert!(!method_has_body(&Method::DELETE));
    }

    #[test]
    fn validate_config_requires_endpoint_url() {
        let adapter = HttpAdapter;
        assert!(!adapter.validate_config(&serde_json::json!({})));
        assert!(adapter.validate_config(&serde_json::json!({"endpoint_url": "https://sink/ingest"})));
    }
}
