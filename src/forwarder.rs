//! Forwarder — the innermost handler a Frontend's middleware chain wraps
//! (spec §4.3 step 3: "innermost is the forwarder bound to the Backend's
//! transport and server list"). Grounded on the teacher's
//! `proxy::context`/`proxy::handler`: a boxed streaming body type, a
//! single exit point that records metrics, and a phased dispatch that
//! selects an upstream, forwards the request, and maps I/O failures to
//! HTTP status codes rather than propagating them to the caller.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use crate::backend::Backend;
use crate::error::ForwardError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// Map a `ForwardError` to the response the spec says the forwarder must
/// produce (spec §7: "dispatch errors become HTTP 5xx responses via the
/// forwarder").
pub fn error_response(err: &ForwardError) -> Response<BoxBody> {
    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    Response::builder()
        .status(err.status())
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| {
            Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(empty_body()).unwrap()
        })
}

/// Forward `req` via `backend`'s transport to an upstream chosen by its
/// load balancer, within the backend's configured timeouts.
pub async fn forward(
    backend: &Backend,
    mut req: Request<BoxBody>,
) -> Result<Response<BoxBody>, ForwardError> {
    let guard = backend.select_upstream().ok_or(ForwardError::NoUpstream)?;

    let target = url::Url::parse(guard.url())
        .map_err(|e| ForwardError::UpstreamConnect(format!("bad upstream url: {}", e)))?;
    let authority = target
        .host_str()
        .map(|h| match target.port() {
            Some(p) => format!("{}:{}", h, p),
            None => h.to_string(),
        })
        .ok_or_else(|| ForwardError::UpstreamConnect("upstream url has no host".to_string()))?;

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let new_uri = format!("{}://{}{}", target.scheme(), authority, path_and_query);
    *req.uri_mut() = new_uri
        .parse()
        .map_err(|e| ForwardError::UpstreamConnect(format!("could not rewrite uri: {}", e)))?;
    req.headers_mut().insert(
        hyper::header::HOST,
        hyper::header::HeaderValue::from_str(&authority)
            .map_err(|e| ForwardError::UpstreamConnect(e.to_string()))?,
    );

    let transport = backend.transport();
    let dispatch = transport.client.request(req);
    let response = tokio::time::timeout(transport.response_header_timeout, dispatch)
        .await
        .map_err(|_| ForwardError::UpstreamTimeout)?
        .map_err(|e| ForwardError::UpstreamConnect(e.to_string()))?;

    drop(guard);
    Ok(response.map(|b| b.map_err(hyper::Error::from).boxed()))
}

/// Enforce a read timeout while buffering the incoming request body is not
/// this module's job — the Server applies socket-level read/write/idle
/// timeouts (spec §4.2); this helper is only used by tests that need to
/// assemble a minimal request body within a bound.
pub fn body_from_incoming(body: Incoming) -> BoxBody {
    body.map_err(hyper::Error::from).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_the_right_status() {
        let resp = error_response(&ForwardError::NoRouteMatch);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn no_upstream_maps_to_bad_gateway() {
        let resp = error_response(&ForwardError::NoUpstream);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
