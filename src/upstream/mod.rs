pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;
pub mod pool;
pub mod server;

pub use circuit_breaker::{BreakerCheck, CircuitBreakerRegistry};
pub use health::{HealthMonitor, ProbeKind};
pub use loadbalance::{LoadBalancer, SelectionKey};
pub use pool::{AcquireError, ConnectionPool, Disposition, PooledConnection};
pub use server::{Scheme, ServerHealthState, UpstreamServer};
