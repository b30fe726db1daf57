//! Read-only admin HTTP surface (SPEC_FULL §4.11, ambient). Grounded on
//! the teacher's `server/admin.rs::handle_admin`: a flat match on
//! `req.uri().path()` that never touches the mutator API, serving health
//! probes, the Prometheus exposition, and a JSON graph dump for
//! operators. Retargeted from the teacher's domain/route dump to the
//! Mux's host/backend/frontend/listener graph via `Mux::dump`.

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;

use crate::forwarder::{full_body, BoxBody};
use crate::metrics::Metrics;
use crate::mux::{Mux, MuxState};

pub async fn handle_admin(
    req: Request<Incoming>,
    mux: Arc<Mux>,
    metrics: Metrics,
) -> Result<Response<BoxBody>, hyper::Error> {
    let response = match req.uri().path() {
        "/health" | "/healthz" => json_response(StatusCode::OK, serde_json::json!({ "status": "ok" })),
        "/ready" | "/readyz" => {
            let ready = matches!(mux.state().await, MuxState::Active);
            let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            json_response(
                status,
                serde_json::json!({
                    "status": if ready { "ready" } else { "starting" },
                    "hosts": mux.host_count(),
                    "backends": mux.backend_count(),
                    "frontends": mux.frontend_count(),
                    "listeners": mux.listener_count(),
                    "routes": mux.route_count(),
                }),
            )
        }
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(metrics.render()))
            .unwrap_or_else(|_| internal_error()),
        "/dump" => json_response(StatusCode::OK, mux.dump()),
        _ => json_response(StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" })),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())))
        .unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full_body("internal error"))
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_response_sets_content_type_and_status() {
        let resp = json_response(StatusCode::NOT_FOUND, serde_json::json!({ "error": "not found" }));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
    }
}
