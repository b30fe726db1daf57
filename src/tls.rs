//! Dynamic per-host TLS resolution for HTTPS listeners (spec §4.2).
//! Grounded on vishalbelsare-agentgateway's `proxy/gateway.rs::
//! maybe_terminate_tls` / `transport/tls.rs` — a `tokio_rustls::
//! LazyConfigAcceptor` reads the ClientHello, resolves a `CertifiedKey` by
//! SNI, then completes the handshake with a `rustls::ServerConfig` built
//! around that resolution. Cert parsing itself (`Host::new`) follows the
//! same repo's `types/agent.rs::parse_cert/parse_key`.
//!
//! The resolver never blocks on the stapler (spec §5): it reads the
//! Mux's live `hosts` map and `StapleCache` directly, both already
//! published via lock-free structures (`DashMap`, `ArcSwap`).

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::host::Host;
use crate::keys::HostKey;
use crate::staple::StapleCache;

/// Resolves a `CertifiedKey` by SNI against the Mux's live host map,
/// falling back to a per-listener default host, attaching the current
/// OCSP staple if one is cached (spec §4.2 steps 1–3).
pub struct SniResolver {
    hosts: Arc<DashMap<HostKey, Arc<Host>>>,
    staples: StapleCache,
    default_host: ArcSwap<Option<HostKey>>,
}

impl SniResolver {
    pub fn new(hosts: Arc<DashMap<HostKey, Arc<Host>>>, staples: StapleCache, default_host: Option<HostKey>) -> Arc<Self> {
        Arc::new(SniResolver { hosts, staples, default_host: ArcSwap::from_pointee(default_host) })
    }

    /// Spec §4.2 `updateListener`/`reload`: swap the listener's default
    /// host pointer atomically; cert and staple data are already live
    /// through the shared `hosts` map and `StapleCache`.
    pub fn set_default_host(&self, default_host: Option<HostKey>) {
        self.default_host.store(Arc::new(default_host));
    }

    fn resolve_for(&self, key: &HostKey) -> Option<Arc<CertifiedKey>> {
        let host = self.hosts.get(key)?;
        let base = host.key_pair.clone()?;
        match self.staples.get(key) {
            Some(staple) => Some(Arc::new(CertifiedKey {
                cert: base.cert.clone(),
                key: base.key.clone(),
                ocsp: Some((*staple).clone()),
            })),
            None => Some(base),
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            let key = HostKey::from(name);
            if let Some(resolved) = self.resolve_for(&key) {
                return Some(resolved);
            }
        }
        // Spec §4.2 step 3: fall back to the listener's default host.
        let default = self.default_host.load();
        if let Some(ref key) = **default {
            return self.resolve_for(key);
        }
        None
    }
}

/// Build a `rustls::ServerConfig` around a `SniResolver`. Only HTTP/1.1 is
/// negotiated unless the caller enables ALPN h2 (the Server decides that
/// per-listener).
pub fn build_server_config(resolver: Arc<SniResolver>, alpn_h2: bool) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = if alpn_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostSpec;

    const TEST_CERT: &str = include_str!("../tests/fixtures/test_cert.pem");
    const TEST_KEY: &str = include_str!("../tests/fixtures/test_key.pem");

    fn host_with_key_pair(name: &str) -> (HostKey, Arc<Host>) {
        let spec = HostSpec {
            key_pair: Some(crate::host::KeyPairSpec { cert_pem: TEST_CERT.to_string(), key_pem: TEST_KEY.to_string() }),
            ocsp: Default::default(),
        };
        let key = HostKey::from(name);
        (key.clone(), Arc::new(Host::new(key, &spec).unwrap()))
    }

    #[test]
    fn resolves_by_exact_sni() {
        let hosts = Arc::new(DashMap::new());
        let (key, host) = host_with_key_pair("secure.example.com");
        hosts.insert(key.clone(), host);
        let resolver = SniResolver::new(hosts, StapleCache::new(), None);
        assert!(resolver.resolve_for(&key).is_some());
        assert!(resolver.resolve_for(&HostKey::from("other.example.com")).is_none());
    }

    #[test]
    fn falls_back_to_default_host() {
        let hosts = Arc::new(DashMap::new());
        let (key, host) = host_with_key_pair("default.example.com");
        hosts.insert(key.clone(), host);
        let resolver = SniResolver::new(hosts, StapleCache::new(), Some(key.clone()));

        let fallback_key = HostKey::from("unknown.example.com");
        let fallback_host = resolver.resolve_for(&fallback_key);
        assert!(fallback_host.is_none());
        let default = resolver.default_host.load();
        assert_eq!(default.as_ref(), &Some(key));
    }

    #[test]
    fn staple_is_attached_when_cached() {
        let hosts = Arc::new(DashMap::new());
        let (key, host) = host_with_key_pair("stapled.example.com");
        hosts.insert(key.clone(), host);
        let staples = StapleCache::new();
        staples.set(key.clone(), Arc::new(vec![9, 9, 9]));
        let resolver = SniResolver::new(hosts, staples, None);
        let resolved = resolver.resolve_for(&key).unwrap();
        assert_eq!(resolved.ocsp.as_deref(), Some(&[9, 9, 9][..]));
    }
}
