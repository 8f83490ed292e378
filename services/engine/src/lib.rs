//! The transmission engine: scheduler, device runtime, connection pool,
//! protocol adapters, circuit breakers, and the bookkeeping they write back
//! to the shared metadata store.

pub mod adapters;
pub mod blob_store;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod control;
pub mod crypto;
pub mod device_monitor;
pub mod device_runtime;
pub mod dispatch;
pub mod http;
pub mod log_writer;
pub mod payload;
pub mod pool;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use config::EngineConfig;
pub use device_runtime::{RuntimeDeviceMap, RuntimeDeviceState};

use std::sync::Arc;

use blob_store::BlobStore;
use store::MetadataStore;

/// The shared process-wide state every subsystem is built on top of:
/// the runtime device map, connection pool, circuit breaker registry,
/// metadata caches, stats registry, and handles to the external stores.
/// Cloning `Engine` is cheap — every field is already an `Arc`.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub devices: RuntimeDeviceMap,
    pub pool: Arc<pool::ConnectionPool>,
    pub breakers: Arc<circuit_breaker::CircuitBreakerRegistry>,
    pub cache: Arc<cache::MetadataCache>,
    pub stats: Arc<stats::StatsRegistry>,
    pub crypto: Arc<crypto::Decryptor>,
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            pool: Arc::new(pool::ConnectionPool::new(
                config.connection_pool_max_idle_seconds,
                config.connection_pool_health_check_interval_seconds,
            )),
            breakers: Arc::new(circuit_breaker::CircuitBreakerRegistry::new(
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_base_recovery_seconds,
                config.circuit_breaker_max_recovery_seconds,
            )),
            cache: Arc::new(cache::MetadataCache::new(
                config.connection_cache_ttl_seconds,
                config.dataset_cache_ttl_seconds,
            )),
            stats: Arc::new(stats::StatsRegistry::new()),
            crypto: Arc::new(crypto::Decryptor::from_env()),
            devices: RuntimeDeviceMap::new(),
            config,
            store,
            blobs,
        }
    }

    /// Gracefully stop all subsystems that hold live resources. Callers are
    /// expected to have already stopped the scheduler loop.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}
