//! OCSP staple integration (spec §4.6). The stapler itself — the thing
//! that actually talks to a CA's OCSP responder — is an external
//! collaborator (spec §1 Out of scope); this module only defines the
//! narrow interface the Mux consumes (a subscribe channel plus a lookup
//! by host key) and the read-mostly cache the TLS resolver reads from on
//! every handshake.
//!
//! Grounded on the teacher's `ArcSwap`-published-snapshot idiom
//! (`routing::RouteTable`, `upstream::cluster::Cluster`'s instance list):
//! the cache is a `DashMap<HostKey, Arc<Vec<u8>>>` so a staple refresh for
//! one host never contends with a handshake resolving another.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::keys::HostKey;

/// `{hostKey}` — spec §6 "OCSP staple events".
#[derive(Debug, Clone)]
pub struct StapleUpdated {
    pub host: HostKey,
}

/// The external OCSP fetcher's contract (spec §1, §4.6): a subscribe
/// channel emitting `StapleUpdated` events, and a lookup by host key used
/// to retrieve the current staple bytes once an update is signalled.
pub trait StapleSource: Send + Sync {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StapleUpdated>;
    fn lookup(&self, host: &HostKey) -> Option<Arc<Vec<u8>>>;
}

/// A `StapleSource` with no events and no staples — the default when no
/// stapler is configured. `Mux::start` still spawns the consumer task
/// against it; the task simply awaits a channel that never produces.
#[derive(Default)]
pub struct NullStapleSource;

impl StapleSource for NullStapleSource {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StapleUpdated> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn lookup(&self, _host: &HostKey) -> Option<Arc<Vec<u8>>> {
        None
    }
}

/// Per-handshake-readable cache of the latest staple bytes per host.
/// Populated only by the Mux's staple-consumer task (spec §4.6); never
/// written on the handshake path (spec §5: "Staple retrieval per
/// handshake is a non-blocking map lookup").
#[derive(Clone, Default)]
pub struct StapleCache {
    staples: Arc<DashMap<HostKey, Arc<Vec<u8>>>>,
}

impl StapleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &HostKey) -> Option<Arc<Vec<u8>>> {
        self.staples.get(host).map(|e| e.value().clone())
    }

    pub fn set(&self, host: HostKey, staple: Arc<Vec<u8>>) {
        self.staples.insert(host, staple);
    }

    /// Spec §8: "After `DeleteHost(h)` followed by `GetStaple(h)`: the
    /// staple is absent."
    pub fn invalidate(&self, host: &HostKey) {
        self.staples.remove(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_removes_the_staple() {
        let cache = StapleCache::new();
        let host = HostKey::from("api.example.com");
        cache.set(host.clone(), Arc::new(vec![1, 2, 3]));
        assert!(cache.get(&host).is_some());
        cache.invalidate(&host);
        assert!(cache.get(&host).is_none());
    }

    #[tokio::test]
    async fn null_source_never_emits() {
        let source = NullStapleSource;
        let mut rx = source.subscribe();
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await.is_err());
    }
}
