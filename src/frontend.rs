//! Frontend — a compiled route: a predicate, an ordered middleware
//! chain, and a non-owning reference to its Backend (spec §4.3).
//! Grounded on the teacher's `proxy::handler`'s phased request/response
//! loop over `&[Filter]`, generalized from a config-time route table
//! entry to a hot-swappable `ArcSwap`-backed record so `rebuild`/
//! `update` never recreate the `Arc<Frontend>` the Router and the
//! Backend's back-reference both point at.

use std::sync::Arc;

use hyper::{Request, Response};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::forwarder::{self, error_response, BoxBody};
use crate::middleware::{Middleware, MiddlewareOutcome, MiddlewareRegistry, MiddlewareSpec};
use crate::predicate::CompiledPredicate;

/// Per-frontend knobs beyond the route predicate and middleware chain.
/// Spec §3 names "limits, failover, stream/buffer mode" without
/// prescribing a shape; only a response-timeout override is implemented
/// here, mirroring the Backend's own timeout-override pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontendSettings {
    #[serde(default)]
    pub request_timeout_secs: Option<f64>,
}

#[derive(Clone)]
struct ChainEntry {
    spec: MiddlewareSpec,
    middleware: Arc<Middleware>,
}

#[derive(Clone)]
struct FrontendState {
    predicate: CompiledPredicate,
    backend: Arc<Backend>,
    settings: FrontendSettings,
    chain: Vec<ChainEntry>,
}

/// The live Frontend record. Interior `ArcSwap` state lets `rebuild`,
/// `update_backend`, and `update_predicate` mutate a Frontend in place —
/// the Router and `Backend.frontends` both hold the same `Arc<Frontend>`
/// across such changes, so nothing needs re-registering to observe them.
pub struct Frontend {
    state: arc_swap::ArcSwap<FrontendState>,
}

impl Frontend {
    pub fn new(predicate: CompiledPredicate, backend: Arc<Backend>, settings: FrontendSettings) -> Self {
        Frontend {
            state: arc_swap::ArcSwap::from_pointee(FrontendState { predicate, backend, settings, chain: Vec::new() }),
        }
    }

    pub fn predicate_matches(&self, host: &str, path: &str, method: &str) -> bool {
        self.state.load().predicate.matches(host, path, method)
    }

    pub fn backend(&self) -> Arc<Backend> {
        self.state.load().backend.clone()
    }

    /// `rebuild()` contract (spec §4.3): sort by `(priority asc, id asc)`,
    /// instantiate every middleware, and only then replace the chain — a
    /// factory error leaves the previously-registered chain untouched.
    ///
    /// A spec byte-identical to the one already running is reused rather
    /// than rebuilt: some middlewares (`RequestRateLimit`) own background
    /// state, so rebuilding one on every unrelated mutation of the same
    /// frontend would orphan its old instance on each call.
    pub fn rebuild(
        &self,
        frontend_key: &str,
        middleware_specs: &[MiddlewareSpec],
        registry: &MiddlewareRegistry,
        stop: &Arc<tokio::sync::Notify>,
    ) -> crate::error::MuxResult<()> {
        let mut sorted: Vec<&MiddlewareSpec> = middleware_specs.iter().collect();
        sorted.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let current = self.state.load();
        let mut chain = Vec::with_capacity(sorted.len());
        for spec in sorted {
            let reused = current.chain.iter().find(|entry| &entry.spec == spec).map(|entry| entry.middleware.clone());
            let middleware = match reused {
                Some(middleware) => middleware,
                None => Arc::new(Middleware::build(&spec.id, frontend_key, spec, registry, stop)?),
            };
            chain.push(ChainEntry { spec: spec.clone(), middleware });
        }

        self.state.store(Arc::new(FrontendState {
            predicate: current.predicate.clone(),
            backend: current.backend.clone(),
            settings: current.settings.clone(),
            chain,
        }));
        Ok(())
    }

    pub fn update_backend(&self, backend: Arc<Backend>) {
        let current = self.state.load();
        self.state.store(Arc::new(FrontendState { backend, ..(**current).clone() }));
    }

    pub fn update_predicate(&self, predicate: CompiledPredicate) {
        let current = self.state.load();
        self.state.store(Arc::new(FrontendState { predicate, ..(**current).clone() }));
    }

    /// Run the middleware chain, in priority order, around a forward
    /// through this Frontend's Backend. Both the request and the
    /// response phase walk the chain in the same `(priority asc, id
    /// asc)` order (spec §8 scenario 2: a `priority:1` middleware's
    /// effect is observable before a `priority:2` middleware's, on both
    /// legs of the round trip).
    pub async fn handle(&self, mut req: Request<BoxBody>) -> Response<BoxBody> {
        let state = self.state.load_full();

        for entry in &state.chain {
            match entry.middleware.on_request(req).await {
                MiddlewareOutcome::Continue(next) => req = next,
                MiddlewareOutcome::Reject(resp) => return resp,
            }
        }

        let mut resp = match forwarder::forward(&state.backend, req).await {
            Ok(resp) => resp,
            Err(err) => error_response(&err),
        };

        for entry in &state.chain {
            resp = entry.middleware.on_response(resp);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSpec, TransportDefaults};
    use crate::keys::BackendKey;

    fn backend() -> Arc<Backend> {
        Arc::new(Backend::new(BackendKey::from("b1"), &BackendSpec::default(), &TransportDefaults::default()))
    }

    #[test]
    fn predicate_matches_reflects_initial_route() {
        let f = Frontend::new(CompiledPredicate::parse(r#"Host("api.example.com")"#).unwrap(), backend(), FrontendSettings::default());
        assert!(f.predicate_matches("api.example.com", "/", "GET"));
        assert!(!f.predicate_matches("other.example.com", "/", "GET"));
    }

    #[test]
    fn update_predicate_is_visible_through_the_same_handle() {
        let f = Arc::new(Frontend::new(CompiledPredicate::parse(r#"Host("old.example.com")"#).unwrap(), backend(), FrontendSettings::default()));
        let held: Arc<Frontend> = f.clone();
        f.update_predicate(CompiledPredicate::parse(r#"Host("new.example.com")"#).unwrap());
        assert!(held.predicate_matches("new.example.com", "/", "GET"));
    }

    #[tokio::test]
    async fn rebuild_runs_middlewares_in_priority_order() {
        use crate::middleware::{HeaderOp, HeaderOpAction, HeaderTransformSpec};

        let f = Frontend::new(CompiledPredicate::parse(r#"Host("api.example.com")"#).unwrap(), backend(), FrontendSettings::default());
        let registry = MiddlewareRegistry::new();
        let specs = vec![
            MiddlewareSpec {
                id: "a".to_string(),
                priority: 2,
                kind: "headers".to_string(),
                spec: serde_json::to_value(HeaderTransformSpec {
                    request: vec![],
                    response: vec![crate::middleware::headers::HeaderOpSpec { name: "x-order".to_string(), value: "outer".to_string(), action: HeaderOpAction::Add }],
                })
                .unwrap(),
            },
            MiddlewareSpec {
                id: "b".to_string(),
                priority: 1,
                kind: "headers".to_string(),
                spec: serde_json::to_value(HeaderTransformSpec {
                    request: vec![],
                    response: vec![crate::middleware::headers::HeaderOpSpec { name: "x-order".to_string(), value: "inner".to_string(), action: HeaderOpAction::Add }],
                })
                .unwrap(),
            },
        ];
        f.rebuild("f1", &specs, &registry, &Arc::new(tokio::sync::Notify::new())).unwrap();

        let req = Request::builder().uri("/").header("host", "api.example.com").body(forwarder::empty_body()).unwrap();
        let resp = f.handle(req).await;
        let values: Vec<&str> = resp.headers().get_all("x-order").iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(values, vec!["inner", "outer"]);
    }

    /// A rebuild that re-submits the same middleware specs reuses the
    /// already-running instances instead of rebuilding them — otherwise a
    /// `RequestRateLimit`'s `RateLimiter`+GC-task pair would be orphaned on
    /// every rebuild, even when nothing about it changed.
    #[tokio::test]
    async fn rebuild_reuses_unchanged_middleware_instances() {
        use crate::middleware::RateLimitSpec;

        let f = Frontend::new(CompiledPredicate::parse(r#"Host("api.example.com")"#).unwrap(), backend(), FrontendSettings::default());
        let registry = MiddlewareRegistry::new();
        let stop = Arc::new(tokio::sync::Notify::new());
        let specs = vec![MiddlewareSpec {
            id: "rl".to_string(),
            priority: 0,
            kind: "requestRateLimit".to_string(),
            spec: serde_json::to_value(RateLimitSpec { rate: 1.0, burst: Some(1), ..Default::default() }).unwrap(),
        }];

        f.rebuild("f1", &specs, &registry, &stop).unwrap();
        let first_entry = f.state.load().chain[0].middleware.clone();

        // First request exhausts the single-token burst.
        let req = Request::builder().uri("/").header("host", "api.example.com").body(forwarder::empty_body()).unwrap();
        let _ = f.handle(req).await;

        // Rebuilding with the identical spec must reuse the same instance —
        // a fresh one would reset the exhausted bucket.
        f.rebuild("f1", &specs, &registry, &stop).unwrap();
        let second_entry = f.state.load().chain[0].middleware.clone();
        assert!(Arc::ptr_eq(&first_entry, &second_entry));

        let req = Request::builder().uri("/").header("host", "api.example.com").body(forwarder::empty_body()).unwrap();
        let resp = f.handle(req).await;
        assert_eq!(resp.status(), hyper::StatusCode::TOO_MANY_REQUESTS);
    }
}
