//! Stats & Health Reporter: emits Prometheus-style counters and
//! histograms via the `metrics` facade, and keeps a cheap in-process
//! snapshot for the human-readable JSON endpoint (`GET /api/v1/stats`)
//! without re-scraping the Prometheus exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;

/// Process-wide counters mirrored in memory for the JSON snapshot
/// endpoint; the `metrics` crate owns the Prometheus-exported view.
#[derive(Default)]
pub struct StatsRegistry {
    messages_success: AtomicU64,
    messages_failed: AtomicU64,
    bytes_transmitted: AtomicU64,
    concurrent_transmissions: AtomicU64,
    db_queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub messages_success: u64,
    pub messages_failed: u64,
    pub bytes_transmitted: u64,
    pub concurrent_transmissions: u64,
    pub active_devices: u64,
    pub active_connections: usize,
    pub db_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, protocol: &str, success: bool, latency: Duration, payload_size: u64) {
        let status = if success { "success" } else { "failed" };
        counter!("messages_total", "protocol" => protocol.to_owned(), "status" => status.to_owned()).increment(1);
        histogram!("transmission_latency_seconds", "protocol" => protocol.to_owned()).record(latency.as_secs_f64());
        if success {
            self.messages_success.fetch_add(1, Ordering::Relaxed);
            counter!("bytes_transmitted_total", "protocol" => protocol.to_owned()).increment(payload_size);
            self.bytes_transmitted.fetch_add(payload_size, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn concurrent_transmissions_delta(&self, delta: i64) {
        let new_value = if delta >= 0 {
            self.concurrent_transmissions.fetch_add(delta as u64, Ordering::Relaxed) + delta as u64
        } else {
            self.concurrent_transmissions.fetch_sub((-delta) as u64, Ordering::Relaxed) - (-delta) as u64
        };
        gauge!("concurrent_transmissions").set(new_value as f64);
    }

    pub fn record_tick_duration(&self, duration: Duration) {
        histogram!("transmission_loop_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_monitor_duration(&self, duration: Duration) {
        histogram!("device_monitor_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_db_query(&self, operation: &str, duration: Duration) {
        self.db_queries.fetch_add(1, Ordering::Relaxed);
        counter!("db_queries_total", "operation" => operation.to_owned()).increment(1);
        histogram!("db_query_duration_seconds", "operation" => operation.to_owned()).record(duration.as_secs_f64());
    }

    pub fn record_cache(&self, cache_type: &str, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counter!("cache_hits_total", "cache_type" => cache_type.to_owned()).increment(1);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            counter!("cache_misses_total", "cache_type" => cache_type.to_owned()).increment(1);
        }
    }

    pub fn set_active_devices(&self, count: u64) {
        gauge!("active_devices").set(count as f64);
    }

    pub fn set_active_connections(&self, count: usize) {
        gauge!("active_connections").set(count as f64);
    }

    pub fn snapshot(&self, active_devices: u64, active_connections: usize) -> StatsSnapshot {
        StatsSnapshot {
            messages_success: self.messages_success.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            concurrent_transmissions: self.concurrent_transmissions.load(Ordering::Relaxed),
            active_devices,
            active_connections,
            db_queries: self.db_queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_publish_tracks_success_and_failure_separately() {
        let stats = StatsRegistry::new();
        stats.record_publish("mqtt", true, Duration::from_millis(10), 128);
        stats.record_publish("mqtt", false, Duration::from_millis(5), 0);
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.messages_success, 1);
        assert_eq!(snap.messages_failed, 1);
        assert_eq!(snap.bytes_transmitted, 128);
    }

    #[test]
    fn concurrent_transmissions_delta_tracks_up_and_down() {
        let stats = StatsRegistry::new();
        stats.concurrent_transmissions_delta(1);
        stats.concurrent_transmissions_delta(1);
        stats.concurrent_transmissions_delta(-1);
        assert_eq!(stats.snapshot(0, 0).concurrent_transmissions, 1);
    }

    #[test]
    fn cache_hit_and_miss_counted_independently() {
        let stats = StatsRegistry::new();
        stats.record_cache("connection", true);
        stats.record_cache("connection", false);
        stats.record_cache("connection", false);
        let snap = stats.snapshot(0, 0);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 2);
    }
}
