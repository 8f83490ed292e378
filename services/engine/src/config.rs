//! Engine configuration loading.
//!
//! TOML is the sole config source for tunables; the database URL
//! and HTTP bind address are read from `DATABASE_URL`/`BIND_ADDR`
//! environment variables instead — ambient deployment concerns, not
//! scheduler tunables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Fully-resolved, defaulted engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub scheduler_tick_interval_ms: u64,
    pub device_monitor_interval_seconds: u64,
    pub max_concurrent_transmissions: usize,
    pub max_active_devices: u64,
    pub connection_pool_max_idle_seconds: u64,
    pub connection_pool_health_check_interval_seconds: u64,
    pub connection_cache_ttl_seconds: u64,
    pub dataset_cache_ttl_seconds: u64,
    pub publish_timeout_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_base_recovery_seconds: u64,
    pub circuit_breaker_max_recovery_seconds: u64,
    /// Whether `message_content` is persisted on transmission logs —
    /// an explicit switch for large-volume deployments rather than an
    /// implicit cap.
    pub log_message_content: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_interval_ms: 250,
            device_monitor_interval_seconds: 15,
            max_concurrent_transmissions: 100,
            max_active_devices: 1_000,
            connection_pool_max_idle_seconds: 300,
            connection_pool_health_check_interval_seconds: 60,
            connection_cache_ttl_seconds: 30,
            dataset_cache_ttl_seconds: 60,
            publish_timeout_seconds: 30,
            retry_backoff_cap_seconds: 30,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_base_recovery_seconds: 30,
            circuit_breaker_max_recovery_seconds: 300,
            log_message_content: true,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_interval_ms)
    }

    pub fn device_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.device_monitor_interval_seconds)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization (all fields optional; defaults fill the rest)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    scheduler_tick_interval_ms: Option<u64>,
    device_monitor_interval_seconds: Option<u64>,
    max_concurrent_transmissions: Option<usize>,
    max_active_devices: Option<u64>,
    connection_pool_max_idle_seconds: Option<u64>,
    connection_pool_health_check_interval_seconds: Option<u64>,
    connection_cache_ttl_seconds: Option<u64>,
    dataset_cache_ttl_seconds: Option<u64>,
    publish_timeout_seconds: Option<u64>,
    retry_backoff_cap_seconds: Option<u64>,
    circuit_breaker_failure_threshold: Option<u32>,
    circuit_breaker_base_recovery_seconds: Option<u64>,
    circuit_breaker_max_recovery_seconds: Option<u64>,
    log_message_content: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_config_from_str(&toml_str)
}

/// Load config from the path named by `ENGINE_CONFIG`, or
/// `/etc/transmission-engine/engine.toml` if unset; missing file falls
/// back to all-default config (every tunable has a documented default).
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    let path = std::env::var("ENGINE_CONFIG")
        .unwrap_or_else(|_| "/etc/transmission-engine/engine.toml".to_owned());
    let path = Path::new(&path);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    load_config_from_path(path)
}

pub fn load_config_from_str(toml_str: &str) -> Result<EngineConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;
    let defaults = EngineConfig::default();
    Ok(EngineConfig {
        scheduler_tick_interval_ms: raw
            .scheduler_tick_interval_ms
            .unwrap_or(defaults.scheduler_tick_interval_ms),
        device_monitor_interval_seconds: raw
            .device_monitor_interval_seconds
            .unwrap_or(defaults.device_monitor_interval_seconds),
        max_concurrent_transmissions: raw
            .max_concurrent_transmissions
            .unwrap_or(defaults.max_concurrent_transmissions),
        max_active_devices: raw.max_active_devices.unwrap_or(defaults.max_active_devices),
        connection_pool_max_idle_seconds: raw
            .connection_pool_max_idle_seconds
            .unwrap_or(defaults.connection_pool_max_idle_seconds),
        connection_pool_health_check_interval_seconds: raw
            .connection_pool_health_check_interval_seconds
            .unwrap_or(defaults.connection_pool_health_check_interval_seconds),
        connection_cache_ttl_seconds: raw
            .connection_cache_ttl_seconds
            .unwrap_or(defaults.connection_cache_ttl_seconds),
        dataset_cache_ttl_seconds: raw
            .dataset_cache_ttl_seconds
            .unwrap_or(defaults.dataset_cache_ttl_seconds),
        publish_timeout_seconds: raw
            .publish_timeout_seconds
            .unwrap_or(defaults.publish_timeout_seconds),
        retry_backoff_cap_seconds: raw
            .retry_backoff_cap_seconds
            .unwrap_or(defaults.retry_backoff_cap_seconds),
        circuit_breaker_failure_threshold: raw
            .circuit_breaker_failure_threshold
            .unwrap_or(defaults.circuit_breaker_failure_threshold),
        circuit_breaker_base_recovery_seconds: raw
            .circuit_breaker_base_recovery_seconds
            .unwrap_or(defaults.circuit_breaker_base_recovery_seconds),
        circuit_breaker_max_recovery_seconds: raw
            .circuit_breaker_max_recovery_seconds
            .unwrap_or(defaults.circuit_breaker_max_recovery_seconds),
        log_message_content: raw.log_message_content.unwrap_or(defaults.log_message_content),
    })
}
