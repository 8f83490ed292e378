//! Connection pool: at most one live protocol handle per
//! `connection_id`, reused across devices and rows. A per-connection-id
//! lock guards create/replace/invalidate, and a separate global lock
//! guards `health_check_all`/`close_all` — the two are never held at
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_proto::Protocol;
use tokio::sync::{Mutex, RwLock};

use crate::adapters::PooledHandle;

struct PoolEntry {
    protocol: Protocol,
    handle: PooledHandle,
    config_snapshot: serde_json::Value,
    created_at: Instant,
    last_used_at: Instant,
    last_health_check: Instant,
    is_healthy: bool,
    use_count: u64,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub protocol: Protocol,
    pub is_healthy: bool,
    pub use_count: u64,
    pub idle_seconds: u64,
}

pub struct ConnectionPool {
    entries: RwLock<HashMap<String, Arc<Mutex<Option<PoolEntry>>>>>,
    global_lock: Mutex<()>,
    max_idle: Duration,
    health_interval: Duration,
}

impl ConnectionPool {
    pub fn new(max_idle_seconds: u64, health_check_interval_seconds: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            global_lock: Mutex::new(()),
            max_idle: Duration::from_secs(max_idle_seconds),
            health_interval: Duration::from_secs(health_check_interval_seconds),
        }
    }

    async fn slot_for(&self, connection_id: &str) -> Arc<Mutex<Option<PoolEntry>>> {
        {
            let entries = self.entries.read().await;
            if let Some(slot) = entries.get(connection_id) {
                return slot.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(connection_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return a healthy handle for `connection_id`, creating one if absent
    /// or replacing it if the stored config differs.
    pub async fn acquire(
        &self,
        connection_id: &str,
        protocol: Protocol,
        config: &serde_json::Value,
        create: impl std::future::Future<Output = Result<PooledHandle, crate::adapters::AdapterError>>,
    ) -> Result<PooledHandle, crate::adapters::AdapterError> {
        let slot = self.slot_for(connection_id).await;
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_mut() {
            if entry.is_healthy && entry.config_snapshot == *config {
                entry.last_used_at = Instant::now();
                entry.use_count += 1;
                return Ok(entry.handle.clone());
            }
            // Config changed or unhealthy: close old, fall through to create.
            let old = guard.take().unwrap();
            old.handle.close().await;
        }

        let handle = create.await?;
        *guard = Some(PoolEntry {
            protocol,
            handle: handle.clone(),
            config_snapshot: config.clone(),
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            last_health_check: Instant::now(),
            is_healthy: true,
            use_count: 1,
        });
        Ok(handle)
    }

    /// No-op in the default design; handles are shared across uses.
    /// Retained as an extension point for future per-use leasing.
    pub async fn release(&self, _connection_id: &str) {}

    pub async fn invalidate(&self, connection_id: &str) {
        let slot = self.slot_for(connection_id).await;
        let had_entry = {
            let mut guard = slot.lock().await;
            match guard.take() {
                Some(entry) => {
                    entry.handle.close().await;
                    true
                }
                None => false,
            }
        };
        if had_entry {
            self.drop_slot_if_unchanged(connection_id, &slot).await;
        }
    }

    /// Remove `connection_id`'s map entry, but only if it still points at
    /// `slot` — a concurrent `acquire` may have already replaced it with a
    /// freshly created one, which must survive.
    async fn drop_slot_if_unchanged(&self, connection_id: &str, slot: &Arc<Mutex<Option<PoolEntry>>>) {
        let mut entries = self.entries.write().await;
        if entries.get(connection_id).is_some_and(|existing| Arc::ptr_eq(existing, slot)) {
            entries.remove(connection_id);
        }
    }

    /// Background loop driving `health_check_all` at the configured
    /// interval — its own dedicated periodic task, the same shape as
    /// the Device Monitor's reconciliation loop.
    pub async fn run_health_check_loop(&self) {
        let mut ticker = tokio::time::interval(self.health_interval);
        loop {
            ticker.tick().await;
            self.health_check_all().await;
        }
    }

    /// Visit every entry; skip ones checked within the health interval,
    /// otherwise run a liveness probe and evict idle entries.
    pub async fn health_check_all(&self) {
        let _global = self.global_lock.lock().await;
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for id in ids {
            let slot = self.slot_for(&id).await;
            let mut guard = slot.lock().await;
            let Some(entry) = guard.as_mut() else { continue };

            if entry.last_used_at.elapsed() > self.max_idle {
                let entry = guard.take().unwrap();
                drop(guard);
                entry.handle.close().await;
                self.drop_slot_if_unchanged(&id, &slot).await;
                continue;
            }

            if entry.last_health_check.elapsed() < self.health_interval {
                continue;
            }
            entry.is_healthy = entry.handle.is_healthy().await;
            entry.last_health_check = Instant::now();
        }
    }

    /// Shut every entry down gracefully; called on engine stop.
    pub async fn close_all(&self) {
        let _global = self.global_lock.lock().await;
        let slots: Vec<(String, Arc<Mutex<Option<PoolEntry>>>)> =
            self.entries.read().await.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect();

        for (id, slot) in &slots {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.take() {
                drop(guard);
                entry.handle.close().await;
                self.drop_slot_if_unchanged(id, slot).await;
            }
        }
    }

    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        let entries = self.entries.read().await;
        let mut out = HashMap::with_capacity(entries.len());
        for (id, slot) in entries.iter() {
            if let Some(entry) = slot.lock().await.as_ref() {
                out.insert(
                    id.clone(),
                    PoolStats {
                        protocol: entry.protocol,
                        is_healthy: entry.is_healthy,
                        use_count: entry.use_count,
                        idle_seconds: entry.last_used_at.elapsed().as_secs(),
                    },
                );
            }
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
