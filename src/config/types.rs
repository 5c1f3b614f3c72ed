//! A1 — `GatewayConfig` and its nested serde types, per the expanded spec's
//! data model. Restructured from the teacher's etcd/consul-oriented
//! `GatewayConfig` (domains → routes → named clusters, service discovery,
//! instance registry) into the flat `routes/listener/pool/breaker/retry/
//! health_check/forwarding/auth` surface the spec names directly — each
//! route now owns its upstream server list inline rather than referencing a
//! separately-registered named cluster, since service discovery (the reason
//! for that indirection in the teacher) is out of scope here.
//!
//! `#[serde(default = "fn")]` is used throughout, following the teacher's
//! convention, so a near-empty config file still produces a runnable gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub admin_listener: AdminListenerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            listener: ListenerConfig::default(),
            admin_listener: AdminListenerConfig::default(),
            pool: PoolConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health_check: HealthCheckConfig::default(),
            forwarding: ForwardingConfig::default(),
            auth: None,
        }
    }
}

impl GatewayConfig {
    /// Rejects structurally invalid routes before the gateway serves traffic,
    /// per spec §4.A1: duplicate route ids, empty upstream server lists.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_ids = std::collections::HashSet::new();
        for route in &self.routes {
            if !route.id.is_empty() && !seen_ids.insert(route.id.as_str()) {
                return Err(format!("duplicate route id: {}", route.id));
            }
            if route.upstream.servers.is_empty() {
                return Err(format!(
                    "route {} has an empty upstream server list",
                    if route.id.is_empty() { &route.pattern } else { &route.id }
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,

    #[serde(default = "default_listen_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            tls: None,
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminListenerConfig {
    #[serde(default = "default_admin_host")]
    pub host: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminListenerConfig {
    fn default() -> Self {
        Self {
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

/// TLS termination is delegated entirely to `rustls`/`hyper-rustls` per the
/// expanded spec's resolution of Open Question (a) — this struct only names
/// the material, it implements no record-layer logic itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_per_target")]
    pub max_per_target: usize,

    #[serde(default = "default_pool_max_total")]
    pub max_total: usize,

    #[serde(default = "default_pool_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_pool_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_target: default_pool_max_per_target(),
            max_total: default_pool_max_total(),
            idle_timeout_secs: default_pool_idle_timeout_secs(),
            max_lifetime_secs: default_pool_max_lifetime_secs(),
        }
    }
}

fn default_pool_max_per_target() -> usize {
    32
}

fn default_pool_max_total() -> usize {
    4096
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_pool_max_lifetime_secs() -> u64 {
    3600
}

impl From<PoolConfig> for crate::upstream::pool::PoolConfig {
    fn from(cfg: PoolConfig) -> Self {
        Self {
            max_per_target: cfg.max_per_target,
            max_total: cfg.max_total,
            idle_timeout: std::time::Duration::from_secs(cfg.idle_timeout_secs),
            max_lifetime: std::time::Duration::from_secs(cfg.max_lifetime_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            reset_timeout_secs: default_cb_reset_timeout_secs(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub retry_on_connect_failure: bool,

    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,

    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_on_connect_failure: true,
            retry_on_timeout: true,
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// "tcp" (default), "http", "ping".
    #[serde(default = "default_hc_kind")]
    pub kind: String,

    #[serde(default = "default_hc_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_hc_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_hc_path")]
    pub http_path: String,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: default_hc_kind(),
            interval_secs: default_hc_interval_secs(),
            timeout_secs: default_hc_timeout_secs(),
            http_path: default_hc_path(),
            healthy_threshold: default_hc_threshold(),
            unhealthy_threshold: default_hc_threshold(),
        }
    }
}

fn default_hc_kind() -> String {
    "tcp".to_string()
}

fn default_hc_interval_secs() -> u64 {
    10
}

fn default_hc_timeout_secs() -> u64 {
    3
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_true")]
    pub add_forwarded_headers: bool,

    #[serde(default)]
    pub preserve_host: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            add_forwarded_headers: true,
            preserve_host: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamServerConfig {
    #[serde(default)]
    pub id: String,

    pub host: String,
    pub port: u16,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// "round_robin" (default), "weighted_round_robin", "least_connections",
    /// "least_response_time", "ip_hash", "random".
    #[serde(default = "default_lb_type")]
    pub lb_type: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub servers: Vec<UpstreamServerConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            lb_type: default_lb_type(),
            servers: Vec::new(),
        }
    }
}

fn default_lb_type() -> String {
    "round_robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCondition {
    pub name: String,

    #[serde(default)]
    pub value: String,

    /// "exact" (default), "prefix", "regex", "present".
    #[serde(default = "default_header_match_type")]
    pub match_type: String,

    #[serde(default)]
    pub invert: bool,
}

fn default_header_match_type() -> String {
    "exact".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub id: String,

    /// Literal-with-`:param` or a `regex:<pattern>` string (a leading
    /// `regex:` prefix selects regex matching, mirroring the teacher's
    /// convention of tagging pattern kind by string prefix rather than a
    /// separate enum field in the wire format).
    pub pattern: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub host_pattern: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub header_conditions: Vec<HeaderCondition>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub cors: Option<CorsConfig>,

    #[serde(default)]
    pub max_body_bytes: Option<u64>,

    /// Compress eligible responses (gzip/brotli, negotiated against the
    /// client's `Accept-Encoding`) before writing them downstream.
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Present iff this route proxies WebSocket upgrades (C12) instead of a
    /// plain HTTP exchange.
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,

    /// Present iff this route proxies an `text/event-stream` upstream (C13).
    #[serde(default)]
    pub sse: Option<SseConfig>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_max_message_bytes")]
    pub max_message_bytes: u64,

    /// Interval at which the proxy pings the client to keep the connection
    /// alive. `None`/absent disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_ws_max_message_bytes(),
            heartbeat_interval_secs: None,
        }
    }
}

fn default_ws_max_message_bytes() -> u64 {
    1 << 20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    #[serde(default = "default_true")]
    pub reconnect: bool,

    #[serde(default = "default_sse_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_sse_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            max_retries: default_sse_max_retries(),
            retry_delay_ms: default_sse_retry_delay_ms(),
        }
    }
}

fn default_sse_max_retries() -> u32 {
    5
}

fn default_sse_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// "token_bucket" (default, smooth with burst) or "sliding_window".
    #[serde(default = "default_rate_limit_mode")]
    pub mode: String,

    #[serde(default)]
    pub rate: Option<f64>,

    #[serde(default)]
    pub burst: Option<u64>,

    #[serde(default)]
    pub count: Option<u64>,

    #[serde(default)]
    pub window_secs: Option<u64>,

    /// "client_ip" (default) or "route" — what bucket/window key to use.
    #[serde(default = "default_rate_limit_key")]
    pub key: String,

    #[serde(default = "default_rejected_code")]
    pub rejected_code: u16,
}

fn default_rate_limit_mode() -> String {
    "token_bucket".to_string()
}

fn default_rate_limit_key() -> String {
    "client_ip".to_string()
}

fn default_rejected_code() -> u16 {
    429
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub allowed_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    vec![
        "GET".to_string(),
        "POST".to_string(),
        "PUT".to_string(),
        "PATCH".to_string(),
        "DELETE".to_string(),
        "OPTIONS".to_string(),
    ]
}

fn default_cors_max_age() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Order in which credential extraction is attempted: "api_key", "basic",
    /// "bearer". Defaults to the spec's stated order.
    #[serde(default = "default_auth_methods")]
    pub methods: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub credentials: Vec<CredentialEntry>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub access_rules: Vec<AccessRule>,
}

fn default_auth_methods() -> Vec<String> {
    vec!["api_key".to_string(), "basic".to_string(), "bearer".to_string()]
}

/// One opaque credential the `CredentialStore` recognizes. JWT signature
/// verification is out of scope (spec §1 Non-goals) — a bearer token is
/// looked up as an opaque string, same as an API key or a basic-auth secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// "api_key", "basic", or "bearer" — which extraction method this
    /// credential is valid under.
    pub kind: String,

    /// The literal secret value (API key, `user:pass`, or bearer token).
    pub secret: String,

    pub user_id: String,

    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub path_pattern: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub required_roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_default_is_empty_but_runnable() {
        let cfg = GatewayConfig::default();
        assert!(cfg.routes.is_empty());
        assert_eq!(cfg.listener.port, 8080);
        assert_eq!(cfg.pool.max_per_target, 32);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.health_check.kind, "tcp");
        assert!(cfg.forwarding.add_forwarded_headers);
        assert!(cfg.auth.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_route_ids() {
        let route = |id: &str| RouteConfig {
            id: id.to_string(),
            pattern: "/".to_string(),
            methods: vec![],
            host_pattern: None,
            header_conditions: vec![],
            priority: 0,
            enabled: true,
            upstream: UpstreamConfig {
                lb_type: "round_robin".to_string(),
                servers: vec![UpstreamServerConfig {
                    id: String::new(),
                    host: "h".to_string(),
                    port: 80,
                    scheme: "http".to_string(),
                    weight: 1,
                    enabled: true,
                    metadata: HashMap::new(),
                }],
            },
            rate_limit: None,
            cors: None,
            max_body_bytes: None,
            enable_compression: true,
            websocket: None,
            sse: None,
            metadata: HashMap::new(),
        };
        let cfg = GatewayConfig {
            routes: vec![route("a"), route("a")],
            ..GatewayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_upstream_server_list() {
        let cfg = GatewayConfig {
            routes: vec![RouteConfig {
                id: "r1".to_string(),
                pattern: "/".to_string(),
                methods: vec![],
                host_pattern: None,
                header_conditions: vec![],
                priority: 0,
                enabled: true,
                upstream: UpstreamConfig::default(),
                rate_limit: None,
                cors: None,
                max_body_bytes: None,
                enable_compression: true,
            websocket: None,
            sse: None,
                metadata: HashMap::new(),
            }],
            ..GatewayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn route_deserializes_from_minimal_json() {
        let json = r#"{
            "pattern": "/v1/users/:id",
            "upstream": {"servers": [{"host": "10.0.0.1", "port": 8080}]}
        }"#;
        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(route.upstream.lb_type, "round_robin");
        assert_eq!(route.upstream.servers[0].weight, 1);
        assert!(route.upstream.servers[0].enabled);
        assert!(route.enabled);
    }
}
