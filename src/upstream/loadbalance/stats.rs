//! Per-server selection statistics, shared across all six strategies.
//!
//! Grounded on the teacher's `upstream/circuit_breaker.rs::CircuitBreakerRegistry`
//! DashMap-of-per-key-state idiom; `averageResponseTime`'s incremental mean
//! needs a read-modify-write that a bare atomic can't give, so (like the
//! breaker's `opened_at`) it lives behind a small mutex rather than a lock-free
//! trick.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct LoadBalancerStats {
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    last_used_at: AtomicU64,
    mean: std::sync::Mutex<f64>,
}

impl Default for LoadBalancerStats {
    fn default() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_used_at: AtomicU64::new(0),
            mean: std::sync::Mutex::new(0.0),
        }
    }
}

impl LoadBalancerStats {
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn last_used_at(&self) -> u64 {
        self.last_used_at.load(Ordering::Acquire)
    }

    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Acquire)
    }

    pub fn average_response_time(&self) -> f64 {
        *self.mean.lock().unwrap()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Acquire)
    }

    /// Called at selection time: one more in-flight request against this server.
    pub fn on_select(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.last_used_at.store(now_millis(), Ordering::Release);
    }

    pub fn record_success(&self, rtt_millis: u64) {
        self.dec_active();
        self.successful_requests.fetch_add(1, Ordering::AcqRel);
        let mut mean = self.mean.lock().unwrap();
        let n = self.successful_requests.load(Ordering::Acquire) as f64;
        *mean = (*mean * (n - 1.0) + rtt_millis as f64) / n;
    }

    pub fn record_failure(&self) {
        self.dec_active();
        self.failed_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_active(&self) {
        // Never below zero: fetch_update on a saturating decrement.
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(1))
            });
    }
}

/// Keyed by `UpstreamServer::target_key()`. Shared by every strategy since
/// the spec treats stats as per-server, not per-strategy-instance, data
/// (strategies only differ in how they *use* these numbers).
#[derive(Default)]
pub struct StatsRegistry {
    entries: DashMap<String, Arc<LoadBalancerStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Arc<LoadBalancerStats> {
        if let Some(s) = self.entries.get(key) {
            return s.clone();
        }
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LoadBalancerStats::default()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_response_time_is_cumulative_mean_of_successes_only() {
        let stats = LoadBalancerStats::default();
        stats.on_select();
        stats.record_success(100);
        stats.on_select();
        stats.record_success(200);
        assert_eq!(stats.average_response_time(), 150.0);
    }

    #[test]
    fn active_connections_never_goes_below_zero() {
        let stats = LoadBalancerStats::default();
        stats.record_success(10);
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn registry_returns_same_instance_for_same_key() {
        let reg = StatsRegistry::new();
        let a = reg.get("h:80");
        a.on_select();
        let b = reg.get("h:80");
        assert_eq!(b.active_connections(), 1);
    }
}
