//! C13 — Server-Sent-Events streaming: parse, (optionally) transform, and
//! forward `text/event-stream` upstream responses, with transparent
//! reconnection on upstream disconnect.
//!
//! New relative to the teacher — `upstream/cluster.rs` has no streaming-body
//! concept beyond what `hyper`'s own body gives it for free. Grounded on
//! `proxy/compression.rs`'s `wrap_encoder_as_body`/`futures_util::stream::unfold`
//! idiom for turning an async producer into a `BoxBody`, and on
//! `proxy/client.rs`'s single-attempt dial-through-the-pool shape, reused
//! here per reconnect instead of per retry.

use crate::config::SseConfig;
use crate::error::GatewayError;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use crate::routing::CompiledRoute;
use crate::upstream::loadbalance::SelectionKey;
use crate::upstream::pool::{ConnectionPool, PooledConnection};
use crate::upstream::server::{Scheme, UpstreamServer};
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One parsed SSE event, per the EventSource specification's field set.
#[derive(Debug, Default, Clone)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Re-serialize per §6: fields separated by `\n`, event terminated by
    /// `\n\n`. Multi-line `data:` is emitted as one `data:` line per input
    /// line, never collapsed.
    fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental parser over raw SSE bytes. Feed it upstream body chunks;
/// it yields complete events as blank lines are observed.
#[derive(Default)]
struct SseParser {
    buf: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
    retry: Option<u64>,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        loop {
            let Some(nl) = self.buf.find('\n') else { break };
            let line: String = self.buf.drain(..=nl).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if let Some(event) = self.finish_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment line, dropped per §4.C13
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "id" => self.id = Some(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                "retry" => self.retry = value.parse().ok(),
                _ => {}
            }
        }
        events
    }

    fn finish_event(&mut self) -> Option<SseEvent> {
        if self.id.is_none() && self.event.is_none() && self.data_lines.is_empty() && self.retry.is_none() {
            return None;
        }
        let event = SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: self.data_lines.join("\n"),
            retry: self.retry.take(),
        };
        self.data_lines.clear();
        Some(event)
    }
}

fn build_uri(server: &UpstreamServer, path_and_query: &str) -> String {
    let scheme = match server.scheme {
        Scheme::Https => "https",
        Scheme::Http => "http",
    };
    format!("{scheme}://{}:{}{}", server.host, server.port, path_and_query)
}

/// One dial-and-request attempt against a freshly selected healthy server.
/// Returns the raw upstream response (caller validates status/content-type)
/// plus the target key used, for stats/breaker bookkeeping.
async fn dial_once(
    route: &CompiledRoute,
    pool: &std::sync::Arc<ConnectionPool>,
    method: &http::Method,
    path_and_query: &str,
    mut headers: http::HeaderMap,
    peer_addr: SocketAddr,
) -> Result<(Response<Incoming>, String), GatewayError> {
    let eligible = route.eligible_servers();
    if eligible.is_empty() {
        return Err(GatewayError::NoHealthyUpstream);
    }

    let key = SelectionKey {
        client_ip: peer_addr.ip(),
        headers: &headers,
        method,
        path: path_and_query,
    };
    let idx = route.lb.select(&key, &route.stats, &eligible).ok_or(GatewayError::NoHealthyUpstream)?;
    let server = eligible[idx].clone();
    let target_key = server.target_key();
    let stats = route.stats.get(&target_key);
    stats.on_select();

    let hop_tokens = crate::headers::connection_header_tokens(&headers);
    crate::headers::strip_hop_by_hop(&mut headers, &hop_tokens);
    headers.insert(http::header::HOST, HeaderValue::from_str(&server.target_key()).unwrap_or_else(|_| HeaderValue::from_static("")));
    headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/event-stream"));

    let uri = build_uri(&server, path_and_query);
    let mut builder = Request::builder().method(method.clone()).uri(&uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = builder.body(empty_body()).map_err(|e| GatewayError::Internal(e.to_string()))?;

    let dial_start = Instant::now();
    let outcome = route
        .breakers
        .execute(&target_key, &route.breaker_config, || async {
            let pooled = pool
                .acquire(&server.host, server.port, Duration::from_secs(5))
                .await
                .map_err(|e| match e {
                    crate::upstream::pool::AcquireError::Timeout => GatewayError::UpstreamTimeout,
                    crate::upstream::pool::AcquireError::Refused(m) | crate::upstream::pool::AcquireError::Unreachable(m) => {
                        GatewayError::DialFailed(m)
                    }
                })?;
            let PooledConnection { target, stream, .. } = pooled;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| GatewayError::DialFailed(e.to_string()))?;

            // The socket is consumed for the lifetime of the SSE stream, not
            // returned to the idle pool — the slot is reclaimed once the
            // connection-driving task observes the socket close.
            let pool_for_release = pool.clone();
            let target_for_release = target.clone();
            let conn_handle = tokio::spawn(async move {
                let _ = conn.await;
                pool_for_release.release_failed(&target_for_release);
            });

            match sender.send_request(upstream_req).await {
                Ok(resp) => Ok(resp),
                Err(e) => {
                    conn_handle.abort();
                    pool.release_failed(&target);
                    Err(GatewayError::UpstreamMalformed(e.to_string()))
                }
            }
        })
        .await;

    match outcome {
        Ok(resp) => {
            stats.record_success(dial_start.elapsed().as_millis() as u64);
            Ok((resp, target_key))
        }
        Err(GatewayError::BreakerOpen) => Err(GatewayError::BreakerOpen),
        Err(e) => {
            stats.record_failure();
            Err(e)
        }
    }
}

/// Drive one upstream SSE stream to completion (or error), forwarding
/// decoded/re-encoded events into `tx`. Returns the last observed event id,
/// for `Last-Event-ID` on the next reconnect.
async fn pump_stream(
    mut body: Incoming,
    tx: &mpsc::Sender<Result<Frame<Bytes>, hyper::Error>>,
    route_id: &str,
) -> Option<String> {
    let mut parser = SseParser::default();
    let mut last_id: Option<String> = None;

    loop {
        let frame = BodyExt::frame(&mut body).await;
        match frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else { continue };
                for event in parser.feed(&data) {
                    if event.id.is_some() {
                        last_id = event.id.clone();
                    }
                    metrics::counter!(
                        "gateway_sse_events_total",
                        "route" => route_id.to_string(),
                    )
                    .increment(1);
                    let encoded = event.encode();
                    if tx.send(Ok(Frame::data(Bytes::from(encoded)))).await.is_err() {
                        return last_id;
                    }
                }
            }
            Some(Err(e)) => {
                debug!("sse: upstream stream error, route={route_id}, error={e}");
                return last_id;
            }
            None => return last_id,
        }
    }
}

/// Entry point: validate the first upstream response, then stream (with
/// transparent reconnection) to the client.
pub async fn handle(
    req: Request<Incoming>,
    route: std::sync::Arc<CompiledRoute>,
    sse_config: &SseConfig,
    pool: std::sync::Arc<ConnectionPool>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let method = req.method().clone();
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_owned()).unwrap_or_else(|| "/".to_owned());
    let headers = req.headers().clone();
    let route_id = route.id.clone();

    let first = dial_once(&route, &pool, &method, &path_and_query, headers.clone(), peer_addr).await;

    let (first_resp, target_key) = match first {
        Ok((resp, target_key)) => {
            let is_sse = resp
                .headers()
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.starts_with("text/event-stream"))
                .unwrap_or(false);
            if !resp.status().is_success() || !is_sse {
                warn!(
                    "sse: upstream response not eligible for SSE proxying, route={}, status={}, content_type={:?}",
                    route_id,
                    resp.status(),
                    resp.headers().get(http::header::CONTENT_TYPE)
                );
                return Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header("content-type", "application/json")
                    .body(full_body(r#"{"error":"upstream did not return an event-stream","status":502}"#))
                    .unwrap();
            }
            (resp, target_key)
        }
        Err(e) => {
            warn!("sse: initial upstream dial failed, route={}, error={}", route_id, e);
            return Response::builder()
                .status(e.status_code())
                .header("content-type", "application/json")
                .body(full_body(format!(r#"{{"error":"{e}","status":{}}}"#, e.status_code().as_u16())))
                .unwrap();
        }
    };

    let (tx, mut rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(64);
    let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    let body: BoxBody = StreamBody::new(stream).boxed();

    let route_owned = route_id.clone();
    let reconnect = sse_config.reconnect;
    let max_retries = sse_config.max_retries;
    let retry_delay = Duration::from_millis(sse_config.retry_delay_ms);
    let pool_for_task = pool;
    // The first response's body must be moved into the pump loop; later
    // reconnect attempts dial fresh ones.
    let route_for_task = route.clone();

    tokio::spawn(async move {
        let mut last_event_id = pump_stream(first_resp.into_body(), &tx, &route_owned).await;
        let mut attempts = 0u32;

        while reconnect && attempts < max_retries {
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(retry_delay).await;
            attempts += 1;

            let mut reconnect_headers = headers.clone();
            if let Some(id) = &last_event_id {
                if let Ok(v) = HeaderValue::from_str(id) {
                    reconnect_headers.insert("last-event-id", v);
                }
            }

            match dial_once(&route_for_task, &pool_for_task, &method, &path_and_query, reconnect_headers, peer_addr).await {
                Ok((resp, _)) => {
                    let is_sse = resp
                        .headers()
                        .get(http::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.starts_with("text/event-stream"))
                        .unwrap_or(false);
                    if !resp.status().is_success() || !is_sse {
                        metrics::counter!(
                            "gateway_sse_reconnects_total",
                            "route" => route_owned.clone(),
                            "outcome" => "rejected",
                        )
                        .increment(1);
                        continue;
                    }
                    metrics::counter!(
                        "gateway_sse_reconnects_total",
                        "route" => route_owned.clone(),
                        "outcome" => "ok",
                    )
                    .increment(1);
                    attempts = 0;
                    last_event_id = pump_stream(resp.into_body(), &tx, &route_owned).await;
                }
                Err(e) => {
                    metrics::counter!(
                        "gateway_sse_reconnects_total",
                        "route" => route_owned.clone(),
                        "outcome" => "failed",
                    )
                    .increment(1);
                    debug!("sse: reconnect dial failed, route={route_owned}, error={e}");
                }
            }
        }
        drop(tx);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(http::header::CONNECTION, HeaderValue::from_static("keep-alive"))
        .header("x-accel-buffering", HeaderValue::from_static("no"))
        .header("x-upstream-addr", HeaderValue::from_str(&target_key).unwrap_or_else(|_| HeaderValue::from_static("")))
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_field_event() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn parses_multiline_data_without_collapsing() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn drops_comment_lines() {
        let mut parser = SseParser::default();
        let events = parser.feed(b": heartbeat\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn captures_id_event_and_retry_fields() {
        let mut parser = SseParser::default();
        let events = parser.feed(b"id: 42\nevent: update\nretry: 3000\ndata: payload\n\n");
        let e = &events[0];
        assert_eq!(e.id.as_deref(), Some("42"));
        assert_eq!(e.event.as_deref(), Some("update"));
        assert_eq!(e.retry, Some(3000));
    }

    #[test]
    fn incremental_feed_across_chunk_boundary() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: par").is_empty());
        let events = parser.feed(b"tial\n\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn encode_round_trips_fields() {
        let event = SseEvent {
            id: Some("1".into()),
            event: Some("msg".into()),
            data: "a\nb".into(),
            retry: Some(500),
        };
        let encoded = event.encode();
        assert!(encoded.contains("id: 1\n"));
        assert!(encoded.contains("data: a\n"));
        assert!(encoded.contains("data: b\n"));
        assert!(encoded.ends_with("\n\n"));
    }
}
