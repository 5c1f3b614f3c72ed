//! Per-route token-bucket / sliding-window limiting.
//!
//! Grounded on `proxy/filter/rate_limit.rs`'s atomics-free `tokio::sync::Mutex`
//! bucket design (a prior CAS-based version under-refilled under contention)
//! and its blended-window sliding-window estimator. The teacher's
//! etcd-instance-count-divided distributed mode is dropped — the expanded
//! spec has no service registry to report instance counts.

use crate::config::RateLimitConfig;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use http::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::FilterResult;

pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    windows: DashMap<String, Arc<SlidingWindow>>,
}

struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
    last_access: AtomicU64,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    window_start: u64,
    max_count: u64,
    window_us: u64,
}

const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;
const MAX_ENTRIES: usize = 100_000;
const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
            windows: DashMap::new(),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, config: &RateLimitConfig, key: &str) -> bool {
        match config.mode.as_str() {
            "sliding_window" => self.check_sliding_window(config, key).await,
            _ => self.check_token_bucket(config, key).await,
        }
    }

    async fn check_token_bucket(&self, config: &RateLimitConfig, key: &str) -> bool {
        let rate = config.rate.unwrap_or(100.0);
        let burst = config.burst.unwrap_or(rate as u64).max(1);
        let max_tokens = (rate as u64 + burst) * PRECISION;
        let rate_per_us = rate / 1_000_000.0;

        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                            rate_per_us,
                            max_tokens,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);
        bucket.try_acquire().await
    }

    async fn check_sliding_window(&self, config: &RateLimitConfig, key: &str) -> bool {
        let max_count = config.count.unwrap_or(1000).max(1);
        let window_secs = config.window_secs.unwrap_or(1).max(1);

        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(SlidingWindow {
                        inner: Mutex::new(SlidingWindowInner {
                            current_count: 0,
                            prev_count: 0,
                            window_start: now,
                            max_count,
                            window_us: window_secs * 1_000_000,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        window.last_access.store(now_us(), Ordering::Relaxed);
        window.try_acquire().await
    }

    /// "route" shares one counter per route; default "client_ip" isolates
    /// per downstream peer.
    pub fn extract_key<'a>(config: &RateLimitConfig, route_id: &'a str, client_ip: &std::net::IpAddr) -> String {
        match config.key.as_str() {
            "route" => route_id.to_string(),
            _ => client_ip.to_string(),
        }
    }

    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;

        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.buckets.len() > MAX_ENTRIES {
            self.force_evict(&self.buckets, now);
        }

        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.windows.len() > MAX_ENTRIES {
            self.force_evict(&self.windows, now);
        }
    }

    fn force_evict<V>(&self, map: &DashMap<String, Arc<V>>, now: u64)
    where
        V: HasLastAccess,
    {
        let overflow = map.len().saturating_sub(MAX_ENTRIES);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(String, u64)> = map
            .iter()
            .map(|r| (r.key().clone(), now.saturating_sub(r.value().last_access().load(Ordering::Relaxed))))
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in entries.into_iter().take(overflow) {
            map.remove(&key);
        }
    }
}

trait HasLastAccess {
    fn last_access(&self) -> &AtomicU64;
}

impl HasLastAccess for Bucket {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}

impl HasLastAccess for SlidingWindow {
    fn last_access(&self) -> &AtomicU64 {
        &self.last_access
    }
}

impl Bucket {
    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        let cost = PRECISION;
        if b.tokens >= cost {
            b.tokens -= cost;
            true
        } else {
            false
        }
    }
}

impl SlidingWindow {
    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut w = self.inner.lock().await;

        while now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += w.window_us;
        }
        if now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = 0;
        }

        let elapsed_in_window = now.saturating_sub(w.window_start);
        let weight = if w.window_us > 0 {
            1.0 - (elapsed_in_window as f64 / w.window_us as f64)
        } else {
            0.0
        };
        let estimated = (w.prev_count as f64 * weight) as u64 + w.current_count;

        if estimated < w.max_count {
            w.current_count += 1;
            true
        } else {
            false
        }
    }
}

pub async fn check(config: &RateLimitConfig, limiter: &RateLimiter, ctx: &mut RequestContext) -> FilterResult {
    let key = RateLimiter::extract_key(config, &ctx.route_name, &ctx.client_ip);

    if !limiter.check(config, &key).await {
        let status = StatusCode::from_u16(config.rejected_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);

        tracing::debug!("middleware: rate_limit: rejected, route={}, key={}", ctx.route_name, key);

        metrics::counter!(
            "gateway_rate_limit_rejected_total",
            "route" => ctx.route_name.clone(),
            "mode" => config.mode.clone(),
        )
        .increment(1);

        return FilterResult::Respond(ctx.error_response(status, "too many requests"));
    }

    metrics::counter!(
        "gateway_rate_limit_allowed_total",
        "route" => ctx.route_name.clone(),
        "mode" => config.mode.clone(),
    )
    .increment(1);

    FilterResult::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bucket_config(rate: f64, burst: u64) -> RateLimitConfig {
        RateLimitConfig {
            mode: "token_bucket".to_string(),
            rate: Some(rate),
            burst: Some(burst),
            count: None,
            window_secs: None,
            key: "route".to_string(),
            rejected_code: 429,
        }
    }

    fn sliding_window_config(count: u64, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig {
            mode: "sliding_window".to_string(),
            rate: None,
            burst: None,
            count: Some(count),
            window_secs: Some(window_secs),
            key: "route".to_string(),
            rejected_code: 429,
        }
    }

    #[tokio::test]
    async fn token_bucket_allows_burst() {
        let limiter = RateLimiter::new();
        let config = token_bucket_config(10.0, 10);

        let mut allowed = 0;
        for _ in 0..20 {
            if limiter.check(&config, "test-key").await {
                allowed += 1;
            }
        }
        assert!(allowed >= 10, "expected at least 10 allowed, got {allowed}");
    }

    #[tokio::test]
    async fn token_bucket_rejects_after_burst() {
        let limiter = RateLimiter::new();
        let config = token_bucket_config(1.0, 1);

        let mut allowed = 0;
        for _ in 0..100 {
            if limiter.check(&config, "exhaust-key").await {
                allowed += 1;
            }
        }
        assert!(allowed < 50, "expected most requests rejected, got {allowed} allowed");
    }

    #[tokio::test]
    async fn sliding_window_basic() {
        let limiter = RateLimiter::new();
        let config = sliding_window_config(5, 60);

        for i in 0..5 {
            assert!(limiter.check(&config, "window-key").await, "request {i} should be allowed");
        }
        assert!(!limiter.check(&config, "window-key").await, "request 6 should be rejected");
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let limiter = RateLimiter::new();
        let config = sliding_window_config(2, 60);

        assert!(limiter.check(&config, "key-a").await);
        assert!(limiter.check(&config, "key-a").await);
        assert!(!limiter.check(&config, "key-a").await);

        assert!(limiter.check(&config, "key-b").await);
        assert!(limiter.check(&config, "key-b").await);
        assert!(!limiter.check(&config, "key-b").await);
    }

    #[test]
    fn extract_key_route_mode_uses_route_name() {
        let cfg = token_bucket_config(10.0, 10);
        let ip: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(RateLimiter::extract_key(&cfg, "my-route", &ip), "my-route");
    }

    #[test]
    fn extract_key_default_mode_uses_client_ip() {
        let mut cfg = token_bucket_config(10.0, 10);
        cfg.key = "client_ip".to_string();
        let ip: std::net::IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(RateLimiter::extract_key(&cfg, "my-route", &ip), "10.0.0.1");
    }
}
