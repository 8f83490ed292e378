//! Process-wide metadata caches: short-TTL connection config and
//! dataset row caches, each independently keyed and lock-guarded so
//! readers never block on a miss in a different key (teacher's
//! `services/receiver/src/cache.rs` TTL-over-a-store shape).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_proto::indexmap_compat::IndexMap;
use engine_proto::{Connection, Protocol};
use tokio::sync::RwLock;

use crate::blob_store::BlobStore;
use crate::stats::StatsRegistry;
use crate::store::{MetadataStore, StoreError};

#[derive(Clone)]
struct ConnectionCacheEntry {
    protocol: Protocol,
    config: serde_json::Value,
    cached_at: Instant,
}

#[derive(Clone)]
struct DatasetCacheEntry {
    rows: Arc<Vec<IndexMap>>,
    file_hash: String,
    file_path: String,
    loaded_at: Instant,
}

pub struct MetadataCache {
    connections: RwLock<HashMap<String, ConnectionCacheEntry>>,
    datasets: RwLock<HashMap<String, DatasetCacheEntry>>,
    connection_ttl: Duration,
    dataset_ttl: Duration,
}

impl MetadataCache {
    pub fn new(connection_ttl_seconds: u64, dataset_ttl_seconds: u64) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            datasets: RwLock::new(HashMap::new()),
            connection_ttl: Duration::from_secs(connection_ttl_seconds),
            dataset_ttl: Duration::from_secs(dataset_ttl_seconds),
        }
    }

    /// Fetch connection config, serving a non-expired cached value or
    /// issuing one SELECT on miss.
    pub async fn get_connection(
        &self,
        connection_id: &str,
        store: &dyn MetadataStore,
        stats: &StatsRegistry,
    ) -> Result<Option<(Protocol, serde_json::Value)>, StoreError> {
        {
            let cache = self.connections.read().await;
            if let Some(entry) = cache.get(connection_id) {
                if entry.cached_at.elapsed() < self.connection_ttl {
                    stats.record_cache("connection", true);
                    return Ok(Some((entry.protocol, entry.config.clone())));
                }
            }
        }
        stats.record_cache("connection", false);

        let Some(conn) = store.fetch_connection(connection_id).await? else {
            return Ok(None);
        };
        let mut cache = self.connections.write().await;
        cache.insert(
            connection_id.to_owned(),
            ConnectionCacheEntry {
                protocol: conn.protocol,
                config: conn.config.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(Some((conn.protocol, conn.config)))
    }

    pub async fn invalidate_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    /// Fetch dataset rows, revalidating a non-expired entry's file hash
    /// against the filesystem before serving it, and refreshing on
    /// mismatch or expiry.
    pub async fn get_dataset_rows(
        &self,
        dataset_id: &str,
        file_path: &str,
        format: engine_proto::DatasetFormat,
        blobs: &dyn BlobStore,
        stats: &StatsRegistry,
    ) -> Result<Arc<Vec<IndexMap>>, crate::blob_store::BlobError> {
        if let Some(entry) = self.datasets.read().await.get(dataset_id).cloned() {
            if entry.loaded_at.elapsed() < self.dataset_ttl {
                let current_hash = blobs.file_hash(file_path).await?;
                if current_hash == entry.file_hash {
                    stats.record_cache("dataset", true);
                    return Ok(entry.rows);
                }
            }
        }
        stats.record_cache("dataset", false);

        let rows = Arc::new(blobs.read_dataset(file_path, format).await?);
        let file_hash = blobs.file_hash(file_path).await?;
        let mut cache = self.datasets.write().await;
        cache.insert(
            dataset_id.to_owned(),
            DatasetCacheEntry {
                rows: rows.clone(),
                file_hash,
                file_path: file_path.to_owned(),
                loaded_at: Instant::now(),
            },
        );
        Ok(rows)
    }

    pub async fn invalidate_dataset(&self, dataset_id: &str) {
        self.datasets.write().await.remove(dataset_id);
    }
}

/// Helper used by `Connection` consumers that want the typed struct back
/// from the cache tuple (adapters only need protocol/config separately).
pub fn as_connection(id: &str, protocol: Protocol, config: serde_json::Value) -> Connection {
    Connection {
        id: id.to_owned(),
        protocol,
        config,
        is_deleted: false,
    }
}
