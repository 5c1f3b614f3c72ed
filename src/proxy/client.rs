//! C10 — upstream HTTP client: pooled-connection dispatch with retries.
//!
//! The teacher sends upstream requests through `hyper_util`'s legacy
//! `Client`, which owns its own connection pool with no `acquire`/`release`
//! contract to expose — incompatible with C5's explicit pool. This module
//! dials through `upstream::pool::ConnectionPool` instead, driving a raw
//! `hyper::client::conn::http1` handshake per attempt and handing the
//! socket back to the pool afterward. The retry loop structure, hop-header
//! hygiene, and forwarded-header injection are carried over from
//! `proxy/handler.rs`'s `phase_upstream`/`inject_forwarded_headers`,
//! generalized from named clusters to `CompiledRoute`'s own server list.

use crate::config::RetryConfig;
use crate::error::GatewayError;
use crate::headers::{connection_header_tokens, strip_hop_by_hop};
use crate::proxy::context::{empty_body, full_body, BoxBody};
use crate::routing::CompiledRoute;
use crate::upstream::loadbalance::SelectionKey;
use crate::upstream::pool::{ConnectionPool, Disposition, PooledConnection};
use crate::upstream::server::{Scheme, UpstreamServer};
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderName, HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// `X-Forwarded-For`/`-Proto`/`-Host`/`-Port` and `Via`, per spec §4.C10.
pub fn inject_forwarded_headers(headers: &mut http::HeaderMap, peer_addr: SocketAddr, original_host: &str, enabled: bool) {
    if !enabled {
        return;
    }
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XFPORT: HeaderName = HeaderName::from_static("x-forwarded-port");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{existing}, {peer_ip}");
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }
    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&peer_addr.port().to_string()) {
        headers.insert(XFPORT.clone(), v);
    }
    headers.insert(HeaderName::from_static("via"), HeaderValue::from_static("1.1 gateway"));
}

fn apply_host_header(headers: &mut http::HeaderMap, preserve_host: bool, original_host: &str, server: &UpstreamServer) {
    if preserve_host {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(HOST, v);
        }
        return;
    }
    let authority = format!("{}:{}", server.host, server.port);
    if let Ok(v) = HeaderValue::from_str(&authority) {
        headers.insert(HOST, v);
    }
}

fn is_retryable_status(status: u16, retry: &RetryConfig) -> bool {
    retry.retryable_statuses.contains(&status)
}

async fn send_once(
    pool: &ConnectionPool,
    server: &UpstreamServer,
    req: Request<BoxBody>,
    connect_timeout: Duration,
) -> Result<(Response<Incoming>, Duration), GatewayError> {
    let pooled = pool
        .acquire(&server.host, server.port, connect_timeout)
        .await
        .map_err(|e| match e {
            crate::upstream::pool::AcquireError::Timeout => GatewayError::UpstreamTimeout,
            crate::upstream::pool::AcquireError::Refused(m)
            | crate::upstream::pool::AcquireError::Unreachable(m) => GatewayError::DialFailed(m),
        })?;

    let PooledConnection { id, target, stream, created_at, .. } = pooled;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            pool.release_failed(&target);
            return Err(GatewayError::DialFailed(e.to_string()));
        }
    };
    let conn_task = tokio::spawn(conn.without_shutdown());

    let start = Instant::now();
    let result = sender.send_request(req).await;
    drop(sender);

    match result {
        Ok(resp) => {
            let elapsed = start.elapsed();
            match conn_task.await {
                Ok(Ok(parts)) => {
                    let reclaimed = PooledConnection {
                        id,
                        target,
                        stream: parts.io.into_inner(),
                        created_at,
                        last_used_at: Instant::now(),
                    };
                    pool.release(reclaimed, Disposition::Reusable).await;
                }
                _ => pool.release_failed(&target),
            }
            Ok((resp, elapsed))
        }
        Err(e) => {
            let _ = conn_task.await;
            pool.release_failed(&target);
            Err(GatewayError::UpstreamMalformed(e.to_string()))
        }
    }
}

pub struct ForwardRequest<'a> {
    pub method: http::Method,
    pub uri_path_and_query: &'a str,
    pub headers: http::HeaderMap,
    pub body_bytes: Option<Bytes>,
    pub streaming_body: Option<BoxBody>,
    pub peer_addr: SocketAddr,
    pub original_host: &'a str,
    pub preserve_host: bool,
    pub add_forwarded_headers: bool,
}

/// Run the full C10/C11 forwarding attempt loop against `route`'s servers:
/// select a healthy server, guard via the breaker, dispatch through the
/// pool, and retry per `route.retry` on network failures / retryable
/// statuses. Returns the last error's status-mapped response when every
/// attempt is exhausted.
pub async fn forward(
    route: &CompiledRoute,
    pool: &ConnectionPool,
    route_name: &str,
    mut request: ForwardRequest<'_>,
) -> Result<(Response<BoxBody>, Duration, String), GatewayError> {
    let eligible = route.eligible_servers();
    if eligible.is_empty() {
        return Err(GatewayError::NoHealthyUpstream);
    }

    let retry = &route.retry;
    let max_attempts = retry.max_retries + 1;
    let mut streaming_body = request.streaming_body.take();
    let mut tried: Vec<String> = Vec::new();
    let mut last_err = GatewayError::NoHealthyUpstream;

    for attempt in 0..max_attempts {
        let candidates: Vec<UpstreamServer> =
            eligible.iter().filter(|s| !tried.contains(&s.target_key())).cloned().collect();
        if candidates.is_empty() {
            break;
        }

        let key = SelectionKey {
            client_ip: request.peer_addr.ip(),
            headers: &request.headers,
            method: &request.method,
            path: request.uri_path_and_query,
        };
        let idx = match route.lb.select(&key, &route.stats, &candidates) {
            Some(i) => i,
            None => break,
        };
        let server = candidates[idx].clone();
        let target_key = server.target_key();
        let stats = route.stats.get(&target_key);
        stats.on_select();

        let mut headers = request.headers.clone();
        apply_host_header(&mut headers, request.preserve_host, request.original_host, &server);
        let hop_tokens = connection_header_tokens(&headers);
        strip_hop_by_hop(&mut headers, &hop_tokens);
        inject_forwarded_headers(&mut headers, request.peer_addr, request.original_host, request.add_forwarded_headers);

        let scheme = match server.scheme {
            Scheme::Https => "https",
            Scheme::Http => "http",
        };
        let uri = format!("{scheme}://{}:{}{}", server.host, server.port, request.uri_path_and_query);

        let body: BoxBody = if let Some(ref b) = request.body_bytes {
            full_body(b.clone())
        } else {
            streaming_body.take().unwrap_or_else(empty_body)
        };

        let mut builder = Request::builder().method(request.method.clone()).uri(&uri);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let upstream_req = match builder.body(body) {
            Ok(r) => r,
            Err(e) => return Err(GatewayError::Internal(e.to_string())),
        };

        let connect_timeout = Duration::from_millis(2000);
        let outcome = route
            .breakers
            .execute(&target_key, &route.breaker_config, || {
                send_once(pool, &server, upstream_req, connect_timeout)
            })
            .await;

        match outcome {
            Ok((resp, elapsed)) => {
                let status = resp.status().as_u16();
                if status >= 500 && is_retryable_status(status, retry) && attempt + 1 < max_attempts {
                    debug!("client: retryable status {status}, route={route_name}, upstream={target_key}, attempt={attempt}");
                    stats.record_failure();
                    tried.push(target_key.clone());
                    last_err = GatewayError::UpstreamMalformed(format!("status {status}"));
                    tokio::time::sleep(Duration::from_millis(retry.retry_delay_ms)).await;
                    continue;
                }
                stats.record_success(elapsed.as_millis() as u64);
                use http_body_util::BodyExt;
                let (parts, body) = resp.into_parts();
                let resp = Response::from_parts(parts, body.boxed());
                return Ok((resp, elapsed, target_key));
            }
            Err(GatewayError::BreakerOpen) => {
                tried.push(target_key);
                continue;
            }
            Err(e @ GatewayError::DialFailed(_)) if retry.retry_on_connect_failure && attempt + 1 < max_attempts => {
                warn!("client: connect failed, route={route_name}, upstream={target_key}, attempt={attempt}");
                stats.record_failure();
                tried.push(target_key);
                last_err = e;
                tokio::time::sleep(Duration::from_millis(retry.retry_delay_ms)).await;
                continue;
            }
            Err(e @ GatewayError::UpstreamTimeout) if retry.retry_on_timeout && attempt + 1 < max_attempts => {
                warn!("client: upstream timeout, route={route_name}, upstream={target_key}, attempt={attempt}");
                stats.record_failure();
                tried.push(target_key);
                last_err = e;
                tokio::time::sleep(Duration::from_millis(retry.retry_delay_ms)).await;
                continue;
            }
            Err(e) => {
                stats.record_failure();
                tried.push(target_key);
                last_err = e;
                if !last_err.is_retryable() || attempt + 1 >= max_attempts {
                    return Err(last_err);
                }
            }
        }
    }

    Err(last_err)
}
