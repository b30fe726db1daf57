//! Backend — a named pool of upstream server URLs plus transport settings
//! (spec §3, §4.4). The transport is an opaque forwarding client shared by
//! every Frontend linked to this backend; mutating the server list never
//! recreates it. Modeled after the teacher's `upstream::cluster::Cluster` /
//! `ClusterStore`: a config-vs-runtime-state split, and an `update` that
//! rebuilds only the pieces that actually changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};
use crate::forwarder::BoxBody;
use crate::frontend::Frontend;
use crate::keys::{BackendKey, FrontendKey, ServerKey};
use crate::loadbalance::{LoadBalancer, LoadBalancerKind, RequestGuard, UpstreamInstance};

/// A rustls `ServerCertVerifier` that accepts any certificate. Used when a
/// backend's upstream TLS verification is disabled — common for internal
/// traffic with self-signed certs.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Transport-affecting settings, as supplied by a mutator. Missing
/// `dial`/`read` timeouts inherit the Mux's process-wide defaults
/// (spec §4.4 "Timeouts default").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettingsSpec {
    #[serde(default)]
    pub dial_timeout_secs: Option<f64>,
    #[serde(default)]
    pub read_timeout_secs: Option<f64>,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: f64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: f64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: f64,
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout_secs: f64,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_true")]
    pub upstream_tls_verify: bool,
    #[serde(default = "default_true")]
    pub http2: bool,
}

fn default_write_timeout() -> f64 { 30.0 }
fn default_tls_handshake_timeout() -> f64 { 10.0 }
fn default_keep_alive() -> f64 { 60.0 }
fn default_response_header_timeout() -> f64 { 30.0 }
fn default_max_idle_conns() -> usize { 128 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(rename = "type", default)]
    pub backend_type: BackendType,
    #[serde(default)]
    pub settings: BackendSettingsSpec,
    #[serde(default)]
    pub lb: LoadBalancerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendType {
    #[default]
    Http,
}

/// Defaults supplied by the Mux's process-wide config (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct TransportDefaults {
    pub dial_timeout_secs: f64,
    pub read_timeout_secs: f64,
}

impl Default for TransportDefaults {
    fn default() -> Self {
        TransportDefaults { dial_timeout_secs: 5.0, read_timeout_secs: 30.0 }
    }
}

/// The resolved, transport-affecting settings (defaults applied). Compared
/// structurally between an old and new `BackendSpec` to decide whether the
/// transport must be rebuilt on `update`.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedTransportSettings {
    dial_timeout_secs: f64,
    read_timeout_secs: f64,
    tls_handshake_timeout_secs: f64,
    keep_alive_secs: f64,
    max_idle_conns: usize,
    upstream_tls_verify: bool,
    http2: bool,
}

impl ResolvedTransportSettings {
    fn resolve(spec: &BackendSettingsSpec, defaults: &TransportDefaults) -> Self {
        ResolvedTransportSettings {
            dial_timeout_secs: spec.dial_timeout_secs.unwrap_or(defaults.dial_timeout_secs),
            read_timeout_secs: spec.read_timeout_secs.unwrap_or(defaults.read_timeout_secs),
            tls_handshake_timeout_secs: spec.tls_handshake_timeout_secs,
            keep_alive_secs: spec.keep_alive_secs,
            max_idle_conns: spec.max_idle_conns,
            upstream_tls_verify: spec.upstream_tls_verify,
            http2: spec.http2,
        }
    }
}

fn build_transport(
    settings: &ResolvedTransportSettings,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs_f64(settings.keep_alive_secs)));
    http.set_connect_timeout(Some(Duration::from_secs_f64(settings.dial_timeout_secs)));
    http.enforce_http(false);

    let mut builder = hyper_rustls::HttpsConnectorBuilder::new();
    let https = if settings.upstream_tls_verify {
        builder.with_webpki_roots().https_or_http()
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        builder = hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls_config);
        builder.https_or_http()
    };
    let https = if settings.http2 {
        https.enable_http1().enable_http2().wrap_connector(http)
    } else {
        https.enable_http1().wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs_f64(settings.keep_alive_secs))
        .pool_max_idle_per_host(settings.max_idle_conns)
        .build(https)
}

/// The opaque forwarding transport. Request dispatch clones the `Arc` it
/// reads from `Backend::transport` before issuing the request, so swapping
/// the pointer on `update` never disturbs requests already in flight — the
/// old transport is simply dropped once every such clone is gone (spec
/// §4.4: "closed when its in-flight count reaches zero").
pub struct Transport {
    pub client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    pub response_header_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// The live Backend record.
pub struct Backend {
    pub key: BackendKey,
    settings: Mutex<BackendSettingsSpec>,
    transport: arc_swap::ArcSwap<Transport>,
    lb_kind: Mutex<LoadBalancerKind>,
    lb: arc_swap::ArcSwap<LoadBalancer>,
    servers: DashMap<Arc<str>, String>,
    /// Lookup-only weak references, veto deletion while non-empty (spec §9
    /// design note: Backend never shares ownership with Frontend).
    frontends: DashMap<FrontendKey, Weak<Frontend>>,
}

impl Backend {
    pub fn new(key: BackendKey, spec: &BackendSpec, defaults: &TransportDefaults) -> Self {
        let resolved = ResolvedTransportSettings::resolve(&spec.settings, defaults);
        let transport = build_transport(&resolved);
        Backend {
            key,
            settings: Mutex::new(spec.settings.clone()),
            transport: arc_swap::ArcSwap::from_pointee(Transport {
                client: transport,
                response_header_timeout: Duration::from_secs_f64(
                    spec.settings.response_header_timeout_secs,
                ),
                read_timeout: Duration::from_secs_f64(resolved.read_timeout_secs),
                write_timeout: Duration::from_secs_f64(spec.settings.write_timeout_secs),
            }),
            lb_kind: Mutex::new(spec.lb),
            lb: arc_swap::ArcSwap::new(LoadBalancer::new(spec.lb)),
            servers: DashMap::new(),
            frontends: DashMap::new(),
        }
    }

    /// Apply a new spec. Rebuilds the transport only if transport-affecting
    /// settings changed (spec §4.4); the server list and LB instance survive
    /// untouched either way.
    pub fn update(&self, spec: &BackendSpec, defaults: &TransportDefaults) {
        let old_resolved = {
            let guard = self.settings.lock().unwrap();
            ResolvedTransportSettings::resolve(&guard, defaults)
        };
        let new_resolved = ResolvedTransportSettings::resolve(&spec.settings, defaults);

        if old_resolved != new_resolved {
            let transport = build_transport(&new_resolved);
            self.transport.store(Arc::new(Transport {
                client: transport,
                response_header_timeout: Duration::from_secs_f64(
                    spec.settings.response_header_timeout_secs,
                ),
                read_timeout: Duration::from_secs_f64(new_resolved.read_timeout_secs),
                write_timeout: Duration::from_secs_f64(spec.settings.write_timeout_secs),
            }));
        }

        let mut lb_kind_guard = self.lb_kind.lock().unwrap();
        if *lb_kind_guard != spec.lb {
            let fresh = LoadBalancer::new(spec.lb);
            fresh.update_instances(self.current_instances());
            self.lb.store(fresh);
            *lb_kind_guard = spec.lb;
        } else {
            self.lb.load().update_instances(self.current_instances());
        }

        *self.settings.lock().unwrap() = spec.settings.clone();
    }

    pub fn transport(&self) -> Arc<Transport> {
        self.transport.load_full()
    }

    pub fn select_upstream(&self) -> Option<RequestGuard> {
        self.lb.load_full().select()
    }

    fn current_instances(&self) -> Vec<UpstreamInstance> {
        self.servers
            .iter()
            .map(|entry| UpstreamInstance {
                key: ServerKey::new(self.key.clone(), entry.key().as_ref()),
                url: Arc::from(entry.value().as_str()),
                active_requests: Arc::new(AtomicUsize::new(0)),
            })
            .collect()
    }

    pub fn upsert_server(&self, id: &str, url: String) -> MuxResult<()> {
        url::Url::parse(&url).map_err(|e| {
            MuxError::invalid_argument(format!("server url {:?} does not parse: {}", url, e))
        })?;
        self.servers.insert(Arc::from(id), url);
        self.lb.load().update_instances(self.current_instances());
        Ok(())
    }

    pub fn delete_server(&self, id: &str) -> bool {
        let removed = self.servers.remove(id).is_some();
        if removed {
            self.lb.load().update_instances(self.current_instances());
        }
        removed
    }

    pub fn server_urls(&self) -> HashMap<String, String> {
        self.servers.iter().map(|e| (e.key().to_string(), e.value().clone())).collect()
    }

    pub fn link_frontend(&self, key: FrontendKey, frontend: &Arc<Frontend>) {
        self.frontends.insert(key, Arc::downgrade(frontend));
    }

    pub fn unlink_frontend(&self, key: &FrontendKey) {
        self.frontends.remove(key);
    }

    /// Whether any Frontend still references this backend (spec invariant 4:
    /// a Backend may only be deleted when no Frontend references it).
    pub fn has_frontends(&self) -> bool {
        // Weak refs whose Frontend was already dropped don't count; prune
        // them opportunistically so `frontends` doesn't grow unbounded.
        self.frontends.retain(|_, weak| weak.strong_count() > 0);
        !self.frontends.is_empty()
    }
}

/// Central registry of all live backends. Thread-safe, cheaply cloneable.
#[derive(Clone, Default)]
pub struct BackendStore {
    backends: Arc<DashMap<BackendKey, Arc<Backend>>>,
}

impl BackendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BackendKey) -> Option<Arc<Backend>> {
        self.backends.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &BackendKey) -> bool {
        self.backends.contains_key(key)
    }

    pub fn insert(&self, key: BackendKey, backend: Arc<Backend>) {
        self.backends.insert(key, backend);
    }

    pub fn remove(&self, key: &BackendKey) -> Option<Arc<Backend>> {
        self.backends.remove(key).map(|(_, v)| v)
    }

    pub fn for_each(&self, mut f: impl FnMut(&BackendKey, &Arc<Backend>)) {
        for entry in self.backends.iter() {
            f(entry.key(), entry.value());
        }
    }
}
