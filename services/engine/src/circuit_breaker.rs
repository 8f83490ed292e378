//! Per-connection circuit breaker registry.
//!
//! Half-open closes on the *first* success rather than requiring a
//! run of several (see DESIGN.md for why that call was made).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    opened_at: Option<Instant>,
    recovery_delay: Duration,
    /// Bounds the half-open burst to a single in-flight probe.
    half_open_probe_in_flight: bool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
            recovery_delay: Duration::ZERO,
            half_open_probe_in_flight: false,
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
        }
    }
}

/// Process-wide registry, one entry per `connection_id`, created lazily
/// and cheap to keep around until shutdown.
pub struct CircuitBreakerRegistry {
    entries: Mutex<HashMap<String, Arc<Mutex<BreakerEntry>>>>,
    failure_threshold: u32,
    base_recovery: Duration,
    max_recovery: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, base_recovery_seconds: u64, max_recovery_seconds: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
            base_recovery: Duration::from_secs(base_recovery_seconds),
            max_recovery: Duration::from_secs(max_recovery_seconds),
        }
    }

    async fn entry_for(&self, connection_id: &str) -> Arc<Mutex<BreakerEntry>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(connection_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerEntry::new())))
            .clone()
    }

    /// `can_execute`: closed → always true; open → false unless the
    /// recovery delay has elapsed (then transitions to half-open and
    /// permits exactly one probing dispatch); half-open → true only while
    /// no probe is already in flight.
    pub async fn can_execute(&self, connection_id: &str) -> bool {
        let entry = self.entry_for(connection_id).await;
        let mut guard = entry.lock().await;
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = guard.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= guard.recovery_delay {
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.half_open_probe_in_flight {
                    false
                } else {
                    guard.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self, connection_id: &str) {
        let entry = self.entry_for(connection_id).await;
        let mut guard = entry.lock().await;
        guard.total_successes += 1;
        guard.consecutive_failures = 0;
        guard.half_open_probe_in_flight = false;
        if guard.state == CircuitState::HalfOpen {
            guard.state = CircuitState::Closed;
            guard.opened_at = None;
            guard.recovery_delay = Duration::ZERO;
        }
    }

    pub async fn record_failure(&self, connection_id: &str) {
        let entry = self.entry_for(connection_id).await;
        let mut guard = entry.lock().await;
        guard.total_failures += 1;
        guard.half_open_probe_in_flight = false;

        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                    guard.recovery_delay = self.base_recovery;
                }
            }
            CircuitState::HalfOpen => {
                guard.consecutive_failures += 1;
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                guard.recovery_delay = (guard.recovery_delay * 2).min(self.max_recovery);
                if guard.recovery_delay.is_zero() {
                    guard.recovery_delay = self.base_recovery;
                }
            }
            CircuitState::Open => {
                guard.consecutive_failures += 1;
            }
        }
    }

    /// Reset a single connection's breaker, e.g. after a Control Handler
    /// stop with no remaining users of the connection.
    pub async fn reset(&self, connection_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(connection_id);
    }

    pub async fn snapshot(&self, connection_id: &str) -> Option<BreakerSnapshot> {
        let entries = self.entries.lock().await;
        if let Some(entry) = entries.get(connection_id) {
            Some(entry.lock().await.snapshot())
        } else {
            None
        }
    }

    pub async fn all_snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        let entries = self.entries.lock().await;
        let mut out = HashMap::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            out.insert(id.clone(), entry.lock().await.snapshot());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_allows_execution_until_threshold() {
        let reg = CircuitBreakerRegistry::new(5, 30, 300);
        for _ in 0..4 {
            assert!(reg.can_execute("c1").await);
            reg.record_failure("c1").await;
        }
        let snap = reg.snapshot("c1").await.unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn fifth_consecutive_failure_opens_circuit() {
        let reg = CircuitBreakerRegistry::new(5, 30, 300);
        for _ in 0..5 {
            reg.record_failure("c1").await;
        }
        let snap = reg.snapshot("c1").await.unwrap();
        assert_eq!(snap.state, CircuitState::Open);
        assert!(!reg.can_execute("c1").await);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new(5, 30, 300);
        for _ in 0..3 {
            reg.record_failure("c1").await;
        }
        reg.record_success("c1").await;
        let snap = reg.snapshot("c1").await.unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_on_any_success() {
        let reg = CircuitBreakerRegistry::new(1, 0, 300);
        reg.record_failure("c1").await;
        assert!(reg.can_execute("c1").await); // recovery_delay=0, immediately half-open
        reg.record_success("c1").await;
        let snap = reg.snapshot("c1").await.unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_doubles_delay() {
        let reg = CircuitBreakerRegistry::new(1, 0, 300);
        reg.record_failure("c1").await; // closed -> open, delay = base = 0s
        assert!(reg.can_execute("c1").await); // -> half_open
        reg.record_failure("c1").await; // half_open -> open, delay doubles from base
        let snap = reg.snapshot("c1").await.unwrap();
        assert_eq!(snap.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_permits_only_one_probe_at_a_time() {
        let reg = CircuitBreakerRegistry::new(1, 0, 300);
        reg.record_failure("c1").await;
        assert!(reg.can_execute("c1").await);
        // A second concurrent caller must not also get a probe slot.
        assert!(!reg.can_execute("c1").await);
    }

    #[tokio::test]
    async fn reset_clears_breaker_state() {
        let reg = CircuitBreakerRegistry::new(1, 30, 300);
        reg.record_failure("c1").await;
        assert_eq!(reg.snapshot("c1").await.unwrap().state, CircuitState::Open);
        reg.reset("c1").await;
        assert!(reg.snapshot("c1").await.is_none());
    }
}
