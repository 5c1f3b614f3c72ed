//! C7 — six interchangeable load-balancer strategies behind one enum.
//!
//! Kept as a closed-set enum rather than `dyn Trait`, per the teacher's own
//! `LoadBalancer` design (see the old revision of this file) and the spec's
//! §9 design note favoring static dispatch for the hot selection path.
//! Unifies the teacher's split `select_healthy_node`/`select` entry points
//! into the single `select(key, servers)` contract decided in the expanded
//! spec's Open Question (c).

pub mod ip_hash;
pub mod least_connections;
pub mod least_response_time;
pub mod random;
pub mod round_robin;
pub mod stats;
pub mod weighted_round_robin;

use crate::upstream::server::UpstreamServer;
use ip_hash::select as ip_hash_select;
use least_connections::select as least_connections_select;
use least_response_time::select as least_response_time_select;
use random::select as random_select;
use round_robin::RoundRobinState;
use stats::StatsRegistry;
use weighted_round_robin::WeightedRoundRobinState;

/// The sole selection input, per the expanded spec's unification of the
/// teacher's two selection entry points into one.
pub struct SelectionKey<'a> {
    pub client_ip: std::net::IpAddr,
    pub headers: &'a http::HeaderMap,
    pub method: &'a http::Method,
    pub path: &'a str,
}

pub enum LoadBalancer {
    RoundRobin(RoundRobinState),
    WeightedRoundRobin(WeightedRoundRobinState),
    LeastConnections,
    LeastResponseTime,
    IpHash,
    Random,
}

impl LoadBalancer {
    pub fn new(lb_type: &str) -> Self {
        match lb_type {
            "weighted_round_robin" | "smooth_weighted" => {
                Self::WeightedRoundRobin(WeightedRoundRobinState::new())
            }
            "least_connections" | "least_conn" => Self::LeastConnections,
            "least_response_time" | "least_rt" => Self::LeastResponseTime,
            "ip_hash" => Self::IpHash,
            "random" => Self::Random,
            _ => Self::RoundRobin(RoundRobinState::new()),
        }
    }

    /// `servers` must already be filtered to the enabled/healthy subset —
    /// every strategy acts only on what it's handed, per spec §4.C7.
    pub fn select(
        &self,
        key: &SelectionKey<'_>,
        stats: &StatsRegistry,
        servers: &[UpstreamServer],
    ) -> Option<usize> {
        if servers.is_empty() {
            return None;
        }
        match self {
            Self::RoundRobin(state) => state.select(servers.len()),
            Self::WeightedRoundRobin(state) => {
                let weights: Vec<u32> = servers.iter().map(|s| s.weight).collect();
                state.select(&weights)
            }
            Self::LeastConnections => {
                let keys: Vec<String> = servers.iter().map(|s| s.target_key()).collect();
                least_connections_select(stats, &keys)
            }
            Self::LeastResponseTime => {
                let keys: Vec<String> = servers.iter().map(|s| s.target_key()).collect();
                least_response_time_select(stats, &keys)
            }
            Self::IpHash => ip_hash_select(key.client_ip, servers.len()),
            Self::Random => random_select(servers.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::server::Scheme;
    use std::collections::HashMap;

    fn server(id: &str, weight: u32) -> UpstreamServer {
        UpstreamServer {
            id: id.to_string(),
            host: id.to_string(),
            port: 80,
            scheme: Scheme::Http,
            weight,
            enabled: true,
            metadata: HashMap::new(),
        }
    }

    fn key() -> SelectionKey<'static> {
        static HEADERS: std::sync::OnceLock<http::HeaderMap> = std::sync::OnceLock::new();
        static METHOD: std::sync::OnceLock<http::Method> = std::sync::OnceLock::new();
        SelectionKey {
            client_ip: "127.0.0.1".parse().unwrap(),
            headers: HEADERS.get_or_init(http::HeaderMap::new),
            method: METHOD.get_or_init(|| http::Method::GET),
            path: "/",
        }
    }

    #[test]
    fn round_robin_cycles_deterministically() {
        let lb = LoadBalancer::new("round_robin");
        let stats = StatsRegistry::new();
        let servers = vec![server("a", 1), server("b", 1)];
        let k = key();
        assert_eq!(lb.select(&k, &stats, &servers), Some(0));
        assert_eq!(lb.select(&k, &stats, &servers), Some(1));
        assert_eq!(lb.select(&k, &stats, &servers), Some(0));
    }

    #[test]
    fn empty_servers_returns_none_for_every_strategy() {
        let stats = StatsRegistry::new();
        let k = key();
        for kind in [
            "round_robin",
            "weighted_round_robin",
            "least_connections",
            "least_response_time",
            "ip_hash",
            "random",
        ] {
            let lb = LoadBalancer::new(kind);
            assert_eq!(lb.select(&k, &stats, &[]), None, "kind={kind}");
        }
    }
}
