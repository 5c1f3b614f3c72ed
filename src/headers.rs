//! C2 — case-insensitive header access plus request/status line helpers.
//!
//! `http::HeaderMap` is already case-insensitive on lookup, so this module is
//! a thin, domain-named layer over it rather than a reimplementation: the
//! hop-by-hop header set, the `Connection`-header-named-token rule, and the
//! health-probe request-line/status-line (de)serialization that the spec
//! calls out as semantically normative (the rest of RFC 7230 framing is left
//! to hyper, per spec §1's out-of-scope list).

use http::{HeaderMap, HeaderName};

/// Headers that are never forwarded in either direction, per spec §6.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Names listed inside the inbound `Connection` header's value are hop-by-hop
/// for this exchange too, even though they aren't in the static list above.
pub fn connection_header_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tok| tok.trim().to_ascii_lowercase())
        .filter(|tok| !tok.is_empty())
        .collect()
}

/// Remove all hop-by-hop headers from `headers`, including any named inside
/// the (already-captured) inbound `Connection` value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, extra_tokens: &[String]) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for tok in extra_tokens {
        if let Ok(name) = HeaderName::from_bytes(tok.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Format a health-probe HTTP/1.1 request line + headers per spec §6:
/// `GET <path> HTTP/1.1\r\nHost: <host>:<port>\r\nConnection: close\r\n\r\n`.
pub fn format_probe_request(path: &str, host: &str, port: u16) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n",
        path = path,
        host = host,
        port = port
    )
}

/// Parse the status code out of an HTTP/1.1 status line (`HTTP/1.1 200 OK`).
/// Returns `None` if the line is not well-formed.
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.trim_end().splitn(3, ' ');
    let _version = parts.next()?;
    let code = parts.next()?;
    code.parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn extracts_connection_tokens_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("Keep-Alive, X-Custom"),
        );
        let tokens = connection_header_tokens(&headers);
        assert_eq!(tokens, vec!["keep-alive".to_string(), "x-custom".to_string()]);
    }

    #[test]
    fn strip_hop_by_hop_removes_static_and_dynamic_set() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-keep", HeaderValue::from_static("1"));

        let tokens = connection_header_tokens(&headers);
        strip_hop_by_hop(&mut headers, &tokens);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("x-custom"));
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn formats_probe_request_line() {
        let req = format_probe_request("/healthz", "10.0.0.1", 8080);
        assert_eq!(req, "GET /healthz HTTP/1.1\r\nHost: 10.0.0.1:8080\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn parses_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line("HTTP/1.1 503 Service Unavailable"), Some(503));
        assert_eq!(parse_status_line("garbage"), None);
    }
}
