//! C4 — health monitor: periodic TCP/HTTP/ping probes with threshold-based
//! state transitions.
//!
//! Grounded on `upstream/health.rs`'s `run_health_checks` shape (per-tick
//! fan-out across servers via `buffer_unordered`), generalized from
//! HTTP-only to the three probe kinds spec §6 requires. Per-server
//! serialization falls out naturally: each round awaits every server's probe
//! future to completion before the next round is scheduled, so a given
//! server never has two probes in flight concurrently.

use super::server::{ServerHealthState, UpstreamServer};
use crate::config::HealthCheckConfig;
use crate::headers::{format_probe_request, parse_status_line};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp,
    Http,
    /// Open Question (b): identical behavior to `Tcp`, distinct for logging.
    Ping,
}

impl ProbeKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "http" => ProbeKind::Http,
            "ping" => ProbeKind::Ping,
            _ => ProbeKind::Tcp,
        }
    }
}

/// One monitor per health-check configuration; tracks state for an
/// arbitrary, dynamically-growing set of servers keyed by `target_key()`.
pub struct HealthMonitor {
    config: HealthCheckConfig,
    states: DashMap<String, Arc<ServerHealthState>>,
    driver: tokio::sync::Mutex<()>,
    cancel: Arc<tokio::sync::Notify>,
}

impl HealthMonitor {
    pub fn new(config: HealthCheckConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            states: DashMap::new(),
            driver: tokio::sync::Mutex::new(()),
            cancel: Arc::new(tokio::sync::Notify::new()),
        })
    }

    fn state_for(&self, key: &str) -> Arc<ServerHealthState> {
        self.states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ServerHealthState::default()))
            .clone()
    }

    pub fn is_healthy(&self, key: &str) -> bool {
        self.states.get(key).map(|s| s.is_healthy()).unwrap_or(true)
    }

    pub fn healthy_servers<'a>(&self, servers: &'a [UpstreamServer]) -> Vec<&'a UpstreamServer> {
        servers
            .iter()
            .filter(|s| s.enabled && self.is_healthy(&s.target_key()))
            .collect()
    }

    /// Idempotent: pre-registers state (healthy=true) for any new server.
    pub fn start(self: &Arc<Self>, servers: Vec<UpstreamServer>) {
        for s in &servers {
            self.state_for(&s.target_key());
        }

        let monitor = Arc::clone(self);
        let cancel = monitor.cancel.clone();
        let interval = Duration::from_secs(monitor.config.interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                monitor.run_round(&servers).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.notified() => return,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.notify_waiters();
    }

    async fn run_round(self: &Arc<Self>, servers: &[UpstreamServer]) {
        // Held for the whole round so a server's next probe is only
        // scheduled after its current one (and every peer's) completes.
        let _guard = self.driver.lock().await;

        let concurrency = servers.len().max(1);
        let monitor = Arc::clone(self);

        stream::iter(servers.iter().cloned())
            .map(|server| {
                let monitor = monitor.clone();
                async move { monitor.probe_one(&server).await }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
    }

    async fn probe_one(&self, server: &UpstreamServer) {
        let key = server.target_key();
        let state = self.state_for(&key);
        let kind = ProbeKind::parse(&self.config.kind);
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));

        let success = match kind {
            ProbeKind::Tcp | ProbeKind::Ping => probe_tcp(&server.host, server.port, timeout).await,
            ProbeKind::Http => {
                probe_http(&server.host, server.port, &self.config.http_path, timeout).await
            }
        };

        let was_healthy = state.is_healthy();
        let now_healthy = state.record(
            success,
            self.config.unhealthy_threshold as u64,
            self.config.healthy_threshold as u64,
        );

        if was_healthy != now_healthy {
            tracing::warn!(
                "health: {:?} probe transition, target={}, healthy={}, consecutive_failures={}",
                kind,
                key,
                now_healthy,
                state.consecutive_failures(),
            );
        } else {
            tracing::debug!("health: {:?} probe, target={}, success={}", kind, key, success);
        }

        metrics::gauge!("gateway_upstream_health_status", "target" => key.clone())
            .set(if now_healthy { 1.0 } else { 0.0 });
        metrics::counter!(
            "gateway_health_check_total",
            "target" => key,
            "result" => if success { "ok" } else { "fail" },
        )
        .increment(1);
    }
}

async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn probe_http(host: &str, port: u16, path: &str, timeout: Duration) -> bool {
    let fut = async {
        let mut stream = TcpStream::connect((host, port)).await.ok()?;
        let request = format_probe_request(path, host, port);
        stream.write_all(request.as_bytes()).await.ok()?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = Vec::new();
        read_line(&mut reader, &mut line).await.ok()?;
        let line = String::from_utf8_lossy(&line);
        let code = parse_status_line(&line)?;
        Some((200..300).contains(&code))
    };

    tokio::time::timeout(timeout, fut).await.ok().flatten().unwrap_or(false)
}

async fn read_line<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        out.push(byte[0]);
        if out.ends_with(b"\n") {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_healthy_before_any_probe() {
        let monitor = HealthMonitor::new(HealthCheckConfig::default());
        assert!(monitor.is_healthy("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn tcp_probe_against_unroutable_port_fails() {
        let ok = probe_tcp("127.0.0.1", 1, Duration::from_millis(100)).await;
        assert!(!ok);
    }

    #[test]
    fn probe_kind_parses_ping_and_defaults_to_tcp() {
        assert_eq!(ProbeKind::parse("ping"), ProbeKind::Ping);
        assert_eq!(ProbeKind::parse("http"), ProbeKind::Http);
        assert_eq!(ProbeKind::parse("bogus"), ProbeKind::Tcp);
    }
}
