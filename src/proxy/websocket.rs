//! C12 — WebSocket upgrade handshake and bidirectional frame forwarding.
//!
//! The teacher never proxies WebSockets (`upstream/cluster.rs`'s client is
//! plain HTTP/1.1 + HTTP/2). Grounded on `server/mod.rs`'s
//! `serve_connection_with_upgrades` — already the hook point hyper needs to
//! hand a connection off after a `101` — and on the two-task
//! client-forwarder/upstream-forwarder shape from
//! `DanielSarmiento04-kairos-rs/.../services/websocket.rs`, generalized from
//! that file's actix-ws/tokio-tungstenite frame types onto a minimal,
//! hand-rolled RFC 6455 frame codec: neither crate is in this workspace's
//! dependency set, and the spec requires only frame-level forwarding, not a
//! general-purpose WebSocket client/server library.

use crate::config::WebSocketConfig;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use crate::routing::CompiledRoute;
use crate::upstream::loadbalance::SelectionKey;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Which direction a frame is travelling, for `transformHook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToOrigin,
    OriginToClient,
}

#[derive(Debug)]
enum ReadError {
    Io(std::io::Error),
    Closed,
    UnknownOpcode(u8),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read one frame off an RFC 6455 connection. `masked_expected` controls
/// whether the payload mask bit must be set (true when reading frames sent
/// by a client — i.e. we are acting as the server side of this leg).
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, masked_expected: bool) -> Result<Frame, ReadError> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ReadError::Closed
        } else {
            ReadError::Io(e)
        }
    })?;

    let opcode_byte = head[0] & 0x0F;
    let opcode = Opcode::from_byte(opcode_byte).ok_or(ReadError::UnknownOpcode(opcode_byte))?;
    let masked = head[1] & 0x80 != 0;
    let mut len = (head[1] & 0x7F) as u64;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    // Defend against a malicious/misbehaving peer claiming a huge frame
    // length before we've even checked it against `max_message_bytes` — cap
    // the raw read at a hard ceiling, independent of the configured limit,
    // so a single frame can't force an unbounded allocation.
    const HARD_CEILING: u64 = 64 * 1024 * 1024;
    if len > HARD_CEILING {
        return Err(ReadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame length exceeds hard ceiling",
        )));
    }

    let mut payload = BytesMut::zeroed(len as usize);
    stream.read_exact(&mut payload).await?;

    if let Some(key) = mask_key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    } else if masked_expected {
        // Per RFC 6455 a server must reject unmasked frames from a client,
        // but forwarding is more useful here than tearing the proxy down —
        // treat it as malformed input on the wire, not a fatal proxy error.
        debug!("websocket: received unmasked frame where masking was expected");
    }

    Ok(Frame { opcode, payload: payload.freeze() })
}

/// Write one frame. `mask` controls whether we apply client-side masking
/// (true when writing to the upstream leg, where the proxy is the client).
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, opcode: Opcode, payload: &[u8], mask: bool) -> std::io::Result<()> {
    let mut header = Vec::with_capacity(14);
    header.push(0x80 | opcode.as_byte()); // FIN=1, no fragmentation support needed for proxying

    let mask_bit = if mask { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        header.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }

    stream.write_all(&header).await?;
    if mask {
        let key: [u8; 4] = rand::random();
        stream.write_all(&key).await?;
        let mut masked = payload.to_vec();
        for (i, b) in masked.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
        stream.write_all(&masked).await?;
    } else {
        stream.write_all(payload).await?;
    }
    stream.flush().await
}

pub fn derive_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Pick the first client-offered subprotocol the upstream also accepted.
fn negotiate_subprotocol(client_offered: Option<&str>, upstream_selected: Option<&str>) -> Option<String> {
    let offered: Vec<&str> = client_offered.map(|v| v.split(',').map(str::trim).collect()).unwrap_or_default();
    let selected = upstream_selected?;
    offered.iter().find(|o| **o == selected).map(|s| s.to_string())
}

/// `true` iff the request carries a valid WebSocket upgrade handshake.
pub fn is_upgrade_request(headers: &http::HeaderMap) -> bool {
    let has_upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    has_upgrade && has_connection_upgrade
}

/// Dial the selected upstream and perform the client-side WebSocket
/// handshake over a raw `TcpStream`, returning the stream plus whatever
/// subprotocol the upstream selected.
async fn dial_upstream(
    host: &str,
    port: u16,
    path_and_query: &str,
    client_protocols: Option<&str>,
    connect_timeout: Duration,
) -> Result<(TcpStream, Option<String>), String> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| e.to_string())?;

    let mut key_bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut key_bytes);
    let sec_key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

    let mut request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n",
        path = path_and_query,
        host = host,
        port = port,
        key = sec_key,
    );
    if let Some(protocols) = client_protocols {
        request.push_str(&format!("Sec-WebSocket-Protocol: {protocols}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.map_err(|e| e.to_string())?;

    // Read the upstream's response headers line by line until the blank line.
    let mut reader = tokio::io::BufReader::new(&mut stream);
    let mut status_line = String::new();
    tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut status_line)
        .await
        .map_err(|e| e.to_string())?;
    if crate::headers::parse_status_line(&status_line) != Some(101) {
        return Err(format!("upstream refused upgrade: {}", status_line.trim()));
    }

    let mut selected_protocol = None;
    loop {
        let mut line = String::new();
        let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
            .await
            .map_err(|e| e.to_string())?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("sec-websocket-protocol") {
                selected_protocol = Some(value.trim().to_string());
            }
        }
    }

    Ok((stream, selected_protocol))
}

/// Entry point: upgrade the client connection, dial + handshake upstream,
/// then run the bidirectional forwarder. Returns the `101` response to send
/// to the client; the actual forwarding runs in a spawned task once hyper
/// completes the upgrade.
pub async fn handle(
    req: Request<Incoming>,
    route: &CompiledRoute,
    ws_config: &WebSocketConfig,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    let headers = req.headers().clone();
    if !is_upgrade_request(&headers) {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body(r#"{"error":"expected websocket upgrade","status":400}"#))
            .unwrap();
    }

    let Some(client_key) = headers.get("sec-websocket-key").and_then(|v| v.to_str().ok()).map(str::to_owned) else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body(r#"{"error":"missing Sec-WebSocket-Key","status":400}"#))
            .unwrap();
    };

    let eligible = route.eligible_servers();
    if eligible.is_empty() {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full_body(r#"{"error":"no healthy upstream available","status":503}"#))
            .unwrap();
    }

    let key = SelectionKey {
        client_ip: peer_addr.ip(),
        headers: &headers,
        method: req.method(),
        path: req.uri().path(),
    };
    let Some(idx) = route.lb.select(&key, &route.stats, &eligible) else {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full_body(r#"{"error":"no healthy upstream available","status":503}"#))
            .unwrap();
    };
    let server = eligible[idx].clone();

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str().to_owned()).unwrap_or_else(|| "/".to_owned());
    let client_protocols = headers.get("sec-websocket-protocol").and_then(|v| v.to_str().ok()).map(str::to_owned);

    let upstream = dial_upstream(&server.host, server.port, &path_and_query, client_protocols.as_deref(), Duration::from_secs(5)).await;

    let (upstream_stream, selected_protocol) = match upstream {
        Ok(v) => v,
        Err(e) => {
            warn!("websocket: upstream handshake failed, route={}, upstream={}, error={}", route.id, server.target_key(), e);
            route.stats.get(&server.target_key()).record_failure();
            return Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(full_body(format!(r#"{{"error":"{e}","status":502}}"#)))
                .unwrap();
        }
    };

    let accept_key = derive_accept_key(&client_key);
    let subprotocol = negotiate_subprotocol(client_protocols.as_deref(), selected_protocol.as_deref());

    let max_message_bytes = ws_config.max_message_bytes as usize;
    let heartbeat = ws_config.heartbeat_interval_secs.map(Duration::from_secs);
    let route_id = route.id.clone();
    let target_key = server.target_key();
    let stats = route.stats.get(&target_key);
    stats.on_select();

    let mut req = req;
    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                run_forwarders(upgraded, upstream_stream, max_message_bytes, heartbeat, &route_id, &target_key, &stats).await;
            }
            Err(e) => {
                warn!("websocket: client upgrade failed, route={}, error={}", route_id, e);
                stats.record_failure();
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(http::header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(http::header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header("sec-websocket-accept", HeaderValue::from_str(&accept_key).unwrap());
    if let Some(proto) = subprotocol {
        if let Ok(v) = HeaderValue::from_str(&proto) {
            builder = builder.header("sec-websocket-protocol", v);
        }
    }
    builder.body(empty_body()).unwrap()
}

/// Spawn client->origin and origin->client forwarders and run them to
/// completion, mirroring close frames and tearing both sides down together
/// on any transport error (close code 1011), per spec §4.C12.
async fn run_forwarders(
    client: Upgraded,
    upstream: TcpStream,
    max_message_bytes: usize,
    heartbeat: Option<Duration>,
    route_id: &str,
    target_key: &str,
    stats: &std::sync::Arc<crate::upstream::loadbalance::stats::LoadBalancerStats>,
) {
    let client_io = TokioIo::new(client);
    let (mut client_read, mut client_write) = tokio::io::split(client_io);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let route_id_a = route_id.to_string();
    let c2o = tokio::spawn(async move {
        loop {
            match read_frame(&mut client_read, true).await {
                Ok(frame) => {
                    if frame.payload.len() > max_message_bytes {
                        metrics::counter!(
                            "gateway_websocket_frames_dropped_total",
                            "route" => route_id_a.clone(),
                            "direction" => "client_to_origin",
                        )
                        .increment(1);
                        continue;
                    }
                    metrics::counter!(
                        "gateway_websocket_frames_total",
                        "route" => route_id_a.clone(),
                        "direction" => "client_to_origin",
                    )
                    .increment(1);
                    let is_close = frame.opcode == Opcode::Close;
                    if write_frame(&mut upstream_write, frame.opcode, &frame.payload, true).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
                Err(ReadError::Closed) => {
                    let _ = write_frame(&mut upstream_write, Opcode::Close, &[], true).await;
                    break;
                }
                Err(_) => {
                    let _ = write_frame(&mut upstream_write, Opcode::Close, &1011u16.to_be_bytes(), true).await;
                    break;
                }
            }
        }
    });

    // Origin->client forwarder also owns the heartbeat ticker, since both
    // need a `&mut` handle on `client_write` and splitting that handle a
    // third way isn't worth the complexity for a periodic ping.
    let route_id_b = route_id.to_string();
    let o2c = tokio::spawn(async move {
        let mut ticker = heartbeat.map(tokio::time::interval);
        loop {
            let tick = async {
                match &mut ticker {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = read_frame(&mut upstream_read, false) => match frame {
                    Ok(frame) => {
                        if frame.payload.len() > max_message_bytes {
                            metrics::counter!(
                                "gateway_websocket_frames_dropped_total",
                                "route" => route_id_b.clone(),
                                "direction" => "origin_to_client",
                            )
                            .increment(1);
                            continue;
                        }
                        metrics::counter!(
                            "gateway_websocket_frames_total",
                            "route" => route_id_b.clone(),
                            "direction" => "origin_to_client",
                        )
                        .increment(1);
                        let is_close = frame.opcode == Opcode::Close;
                        if write_frame(&mut client_write, frame.opcode, &frame.payload, false).await.is_err() {
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    Err(ReadError::Closed) => {
                        let _ = write_frame(&mut client_write, Opcode::Close, &[], false).await;
                        break;
                    }
                    Err(_) => {
                        let _ = write_frame(&mut client_write, Opcode::Close, &1011u16.to_be_bytes(), false).await;
                        break;
                    }
                },
                _ = tick => {
                    if write_frame(&mut client_write, Opcode::Ping, &[], false).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let _ = tokio::join!(c2o, o2c);
    stats.record_success(0);
    debug!("websocket: forwarders finished, route={route_id}, upstream={target_key}");
}
