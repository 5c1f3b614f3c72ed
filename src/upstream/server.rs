//! C3 — upstream server identity and per-server mutable health state.
//!
//! Grounded on `upstream/cluster.rs`'s node-keyed DashMaps and
//! `upstream/loadbalance.rs`'s `UpstreamInstance`, collapsed into one owned
//! record per spec §3 (`UpstreamServer` + `ServerHealthState`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Immutable once registered; a config reload replaces the whole `Vec` atomically.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub weight: u32,
    pub enabled: bool,
    pub metadata: std::collections::HashMap<String, String>,
}

impl UpstreamServer {
    pub fn target_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-server mutable health counters. All fields are atomics so that a
/// `healthy` reader never needs to take a lock shared with the probe writer;
/// the probe loop still serializes its own read-modify-write under the
/// monitor's per-server sequencing (see `health.rs`).
pub struct ServerHealthState {
    healthy: AtomicBool,
    consecutive_successes: AtomicU64,
    consecutive_failures: AtomicU64,
    last_check_at: AtomicU64,
    last_success_at: AtomicU64,
    last_failure_at: AtomicU64,
    total_checks: AtomicU64,
    total_failures: AtomicU64,
}

impl Default for ServerHealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_successes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_check_at: AtomicU64::new(0),
            last_success_at: AtomicU64::new(0),
            last_failure_at: AtomicU64::new(0),
            total_checks: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }
}

impl ServerHealthState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u64 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    /// Record one probe outcome and apply the threshold transition. Returns
    /// the resulting `healthy` flag. Caller (the health monitor) is
    /// responsible for serializing calls per server so the
    /// read-increment-reset-then-publish sequence below is atomic in effect.
    pub fn record(&self, success: bool, unhealthy_threshold: u64, healthy_threshold: u64) -> bool {
        let now = now_millis();
        self.last_check_at.store(now, Ordering::Relaxed);
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        if success {
            self.last_success_at.store(now, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if !self.healthy.load(Ordering::Acquire) && successes >= healthy_threshold {
                self.healthy.store(true, Ordering::Release);
            }
        } else {
            self.last_failure_at.store(now, Ordering::Relaxed);
            self.total_failures.fetch_add(1, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if self.healthy.load(Ordering::Acquire) && failures >= unhealthy_threshold {
                self.healthy.store(false, Ordering::Release);
            }
        }
        self.healthy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy_by_default() {
        let state = ServerHealthState::default();
        assert!(state.is_healthy());
    }

    #[test]
    fn flips_unhealthy_after_threshold_and_resets_other_counter() {
        let state = ServerHealthState::default();
        assert!(state.record(false, 2, 2));
        assert_eq!(state.consecutive_failures(), 1);
        assert!(!state.record(false, 2, 2));
        assert_eq!(state.consecutive_failures(), 2);
        assert_eq!(state.consecutive_successes(), 0);
    }

    #[test]
    fn flips_back_healthy_after_threshold() {
        let state = ServerHealthState::default();
        state.record(false, 1, 2);
        assert!(!state.is_healthy());
        assert!(!state.record(true, 1, 2));
        assert!(state.record(true, 1, 2));
        assert!(state.is_healthy());
    }

    #[test]
    fn threshold_crossing_leaves_counter_at_threshold_not_zero() {
        let state = ServerHealthState::default();
        state.record(false, 3, 1);
        state.record(false, 3, 1);
        state.record(false, 3, 1);
        assert_eq!(state.consecutive_failures(), 3);
    }
}
