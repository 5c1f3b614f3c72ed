//! A4 — admin HTTP surface: `/health`, `/ready`, `/metrics`, `/routes`.
//!
//! Grounded on the teacher's `server/admin.rs`; `/domains` is dropped since
//! the expanded spec has no domain/cluster registry to introspect, and
//! `/routes` now walks the flat `RouteTable` instead of a host-partitioned
//! tree.

use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(req: Request<Incoming>, state: GatewayState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let route_count = state.route_count();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","total_routes":{}}}"#,
                    route_count,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let table = state.routes.load();
            let routes: Vec<serde_json::Value> = table
                .all()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "priority": r.priority,
                        "enabled": r.enabled,
                        "methods": r.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                        "servers": r.servers.load().iter().map(|s| s.target_key()).collect::<Vec<_>>(),
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
