//! Cross-origin request handling, new relative to the teacher (no CORS
//! filter existed upstream) — grounded on `proxy/context.rs`'s
//! `full_body`/`BoxBody` response-building idiom and `RouteConfig`'s §4
//! `CorsConfig` schema.

use crate::proxy::context::{empty_body, BoxBody};
use http::{HeaderMap, HeaderValue, Method};

use crate::config::CorsConfig;

fn origin_allowed<'a>(cfg: &'a CorsConfig, origin: &str) -> Option<&'a str> {
    if cfg.allowed_origins.iter().any(|o| o == "*") {
        return Some("*");
    }
    cfg.allowed_origins.iter().find(|o| o.as_str() == origin).map(|s| s.as_str())
}

/// Returns `Some(response)` for an OPTIONS preflight that should short-circuit
/// the chain; `None` means the request should continue to routing/proxying
/// (still decorated with CORS headers on the eventual response via
/// `apply_response_headers`).
pub fn handle_preflight(cfg: &CorsConfig, method: &Method, headers: &HeaderMap) -> Option<hyper::Response<BoxBody>> {
    if method != Method::OPTIONS {
        return None;
    }
    let origin = headers.get(http::header::ORIGIN)?.to_str().ok()?;
    let allowed = origin_allowed(cfg, origin)?;

    let mut builder = hyper::Response::builder()
        .status(http::StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", allowed)
        .header("access-control-allow-methods", cfg.allowed_methods.join(", "))
        .header("access-control-allow-headers", cfg.allowed_headers.join(", "))
        .header("access-control-max-age", cfg.max_age_secs.to_string());
    if cfg.allow_credentials {
        builder = builder.header("access-control-allow-credentials", "true");
    }
    builder.body(empty_body()).ok()
}

/// Decorate a normal (non-preflight) response with CORS headers, per the
/// request's `Origin`.
pub fn apply_response_headers(cfg: &CorsConfig, origin: Option<&str>, resp: &mut hyper::Response<BoxBody>) {
    let Some(origin) = origin else { return };
    let Some(allowed) = origin_allowed(cfg, origin) else { return };

    if let Ok(v) = HeaderValue::from_str(allowed) {
        resp.headers_mut().insert("access-control-allow-origin", v);
    }
    if cfg.allow_credentials {
        resp.headers_mut()
            .insert("access-control-allow-credentials", HeaderValue::from_static("true"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CorsConfig {
        CorsConfig {
            allowed_origins: vec!["https://example.com".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            allowed_headers: vec!["content-type".to_string()],
            allow_credentials: true,
            max_age_secs: 600,
        }
    }

    #[test]
    fn origin_allowed_matches_exact() {
        assert_eq!(origin_allowed(&cfg(), "https://example.com"), Some("https://example.com"));
        assert_eq!(origin_allowed(&cfg(), "https://evil.com"), None);
    }

    #[test]
    fn wildcard_allows_any_origin() {
        let mut c = cfg();
        c.allowed_origins = vec!["*".to_string()];
        assert_eq!(origin_allowed(&c, "https://anything.example"), Some("*"));
    }

    #[test]
    fn preflight_requires_options_and_origin() {
        let mut headers = HeaderMap::new();
        assert!(handle_preflight(&cfg(), &Method::GET, &headers).is_none());
        assert!(handle_preflight(&cfg(), &Method::OPTIONS, &headers).is_none());
        headers.insert(http::header::ORIGIN, HeaderValue::from_static("https://example.com"));
        assert!(handle_preflight(&cfg(), &Method::OPTIONS, &headers).is_some());
    }
}
