//! Least-response-time: minimum cumulative-mean response time across servers
//! that have at least one recorded success; servers with zero successes are
//! treated as time 0 and therefore preferred.
//!
//! Replaces the teacher's `PeakEwmaBalancer` (exponentially-decayed latency
//! estimate with an outstanding-request penalty) with the spec's plain
//! cumulative mean — no decay, no penalty term. The per-endpoint-keyed
//! lookup shape is kept from that file.

use super::stats::StatsRegistry;

pub fn select(stats: &StatsRegistry, keys: &[String]) -> Option<usize> {
    if keys.is_empty() {
        return None;
    }
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            let s = stats.get(key);
            let effective = if s.successful_requests() > 0 {
                s.average_response_time()
            } else {
                0.0
            };
            (i, effective)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_server_with_no_successes_over_slow_server() {
        let stats = StatsRegistry::new();
        stats.get("a").on_select();
        stats.get("a").record_success(500);

        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(select(&stats, &keys), Some(1));
    }

    #[test]
    fn picks_lowest_average_among_servers_with_successes() {
        let stats = StatsRegistry::new();
        stats.get("a").on_select();
        stats.get("a").record_success(500);
        stats.get("b").on_select();
        stats.get("b").record_success(100);

        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(select(&stats, &keys), Some(1));
    }

    #[test]
    fn empty_set_returns_none() {
        let stats = StatsRegistry::new();
        assert_eq!(select(&stats, &[]), None);
    }
}
