//! Router — a predicate-to-handler dispatch structure (spec §4.5). The
//! core treats the Router as a collaborator exposing `set_not_found`,
//! `handle`, `remove`, and a dispatch entry point; `RadixRouter` is the
//! default, in-process implementation. Grounded on the teacher's
//! `routing::RouteTable`: mutations build a fresh immutable table and
//! publish it behind an `ArcSwap`, so concurrent mutation and lookup are
//! safe without readers ever taking a lock (spec §4.5, §5).

use std::sync::Arc;

use arc_swap::ArcSwap;
use hyper::{Response, StatusCode};

use crate::forwarder::{full_body, BoxBody};
use crate::frontend::Frontend;
use crate::keys::FrontendKey;

/// The default 404 response (spec §6): JSON body, `Content-Type:
/// application/json`.
pub fn not_found_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-type", "application/json")
        .body(full_body(r#"{"error":"not found"}"#))
        .expect("static response is well-formed")
}

#[derive(Clone)]
struct Entry {
    key: FrontendKey,
    frontend: Arc<Frontend>,
}

/// Router is an external collaborator per spec §4.5/§9; `RadixRouter` is
/// the in-process default this crate ships so the Mux is runnable without
/// wiring an external plugin. Entries are matched in registration order —
/// first predicate match wins, mirroring the teacher's exact-before-
/// wildcard-before-default precedence without inventing an unspecified
/// priority field on Frontend.
#[derive(Clone)]
pub struct RadixRouter {
    entries: Arc<ArcSwap<Vec<Entry>>>,
}

impl Default for RadixRouter {
    fn default() -> Self {
        RadixRouter { entries: Arc::new(ArcSwap::from_pointee(Vec::new())) }
    }
}

impl RadixRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `key`, appending it after any
    /// existing entries unless `key` is already present, in which case the
    /// entry is replaced in place — atomically, via a copy-then-swap of the
    /// whole table (spec §4.3 step 4: "replacing any previous handler for
    /// that key atomically").
    pub fn handle(&self, key: FrontendKey, frontend: Arc<Frontend>) {
        let current = self.entries.load();
        let mut next: Vec<Entry> = Vec::with_capacity(current.len() + 1);
        let mut replaced = false;
        for entry in current.iter() {
            if entry.key == key {
                next.push(Entry { key: key.clone(), frontend: frontend.clone() });
                replaced = true;
            } else {
                next.push(entry.clone());
            }
        }
        if !replaced {
            next.push(Entry { key, frontend });
        }
        self.entries.store(Arc::new(next));
    }

    pub fn remove(&self, key: &FrontendKey) {
        let current = self.entries.load();
        let next: Vec<Entry> = current.iter().filter(|e| &e.key != key).cloned().collect();
        self.entries.store(Arc::new(next));
    }

    /// Find the first Frontend whose predicate matches. Lock-free: a single
    /// atomic load of the published snapshot.
    pub fn dispatch(&self, host: &str, path: &str, method: &str) -> Option<Arc<Frontend>> {
        let entries = self.entries.load();
        entries.iter().find(|e| e.frontend.predicate_matches(host, path, method)).map(|e| e.frontend.clone())
    }

    pub fn route_count(&self) -> usize {
        self.entries.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendSpec, TransportDefaults};
    use crate::frontend::{Frontend, FrontendSettings};
    use crate::keys::BackendKey;
    use crate::predicate::CompiledPredicate;

    fn test_frontend(route: &str) -> Arc<Frontend> {
        let backend =
            Arc::new(Backend::new(BackendKey::from("b1"), &BackendSpec::default(), &TransportDefaults::default()));
        Arc::new(Frontend::new(
            CompiledPredicate::parse(route).unwrap(),
            backend,
            FrontendSettings::default(),
        ))
    }

    #[test]
    fn dispatch_matches_first_registered_winner() {
        let router = RadixRouter::new();
        router.handle(FrontendKey::from("f1"), test_frontend(r#"Host("api.example.com")"#));
        let found = router.dispatch("api.example.com", "/", "GET");
        assert!(found.is_some());
        let missing = router.dispatch("other.example.com", "/", "GET");
        assert!(missing.is_none());
    }

    #[test]
    fn remove_drops_the_route() {
        let router = RadixRouter::new();
        let key = FrontendKey::from("f1");
        router.handle(key.clone(), test_frontend(r#"Host("api.example.com")"#));
        router.remove(&key);
        assert!(router.dispatch("api.example.com", "/", "GET").is_none());
    }

    #[test]
    fn handle_replaces_existing_key_in_place() {
        let router = RadixRouter::new();
        let key = FrontendKey::from("f1");
        router.handle(key.clone(), test_frontend(r#"Host("old.example.com")"#));
        router.handle(key.clone(), test_frontend(r#"Host("new.example.com")"#));
        assert_eq!(router.route_count(), 1);
        assert!(router.dispatch("old.example.com", "/", "GET").is_none());
        assert!(router.dispatch("new.example.com", "/", "GET").is_some());
    }
}
