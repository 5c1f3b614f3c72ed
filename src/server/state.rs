//! Shared gateway state — built once at startup from `GatewayConfig`.
//!
//! Collapses the teacher's `RoutingState`/`InfraState`/`ClusterStore` split
//! (which existed to separate etcd-sourced domains/clusters from local
//! state) into one flat aggregate: there is no longer an external config
//! source to separate from, so `GatewayState` just owns the compiled route
//! table, the shared connection pool (C5), and the rate limiter (C9).

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::middleware::rate_limit::RateLimiter;
use crate::routing::RouteTable;
use crate::upstream::pool::{ConnectionPool, PoolConfig as ConnPoolConfig};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub pool: Arc<ConnectionPool>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let route_table = RouteTable::compile(&config.routes, &config.breaker, &config.retry, &config.health_check);

        let pool = ConnectionPool::new(ConnPoolConfig {
            max_per_target: config.pool.max_per_target,
            max_total: config.pool.max_total,
            idle_timeout: Duration::from_secs(config.pool.idle_timeout_secs),
            max_lifetime: Duration::from_secs(config.pool.max_lifetime_secs),
        });

        let metrics = Metrics::install();
        metrics::gauge!("gateway_config_routes_total").set(route_table.len() as f64);

        let rate_limiter = Arc::new(RateLimiter::new());
        rate_limiter.start_gc();

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            routes: Arc::new(ArcSwap::new(Arc::new(route_table))),
            pool,
            rate_limiter,
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.load().len()
    }
}
