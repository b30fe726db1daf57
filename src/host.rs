//! Host — per-hostname settings, most importantly a TLS key pair and OCSP
//! options (spec §3). Certificate parsing follows the same `rustls_pemfile`
//! `Item` matching used for dynamic TLS listener config in the wider proxy
//! ecosystem: read every PEM block, classify it by `Item` variant, and
//! reject anything that doesn't resolve to exactly one certificate chain
//! and one supported private key type.

use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};
use crate::keys::HostKey;

/// A host's TLS material, as supplied by a mutator call. `cert_pem` may
/// contain a full chain (leaf + intermediates); `key_pem` is a single
/// private key in PKCS#8, PKCS#1, or SEC1 form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairSpec {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcspOptions {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSpec {
    #[serde(default)]
    pub key_pair: Option<KeyPairSpec>,
    #[serde(default)]
    pub ocsp: OcspOptions,
}

/// The live Host record. Cheap to clone: the certified key is behind an
/// `Arc`, so upserts that only touch OCSP options don't re-parse PEM.
#[derive(Clone)]
pub struct Host {
    pub key: HostKey,
    pub key_pair: Option<Arc<CertifiedKey>>,
    pub ocsp: OcspOptions,
}

impl Host {
    pub fn new(key: HostKey, spec: &HostSpec) -> MuxResult<Self> {
        let key_pair = match &spec.key_pair {
            Some(kp) => Some(build_certified_key(kp)?),
            None => None,
        };
        Ok(Host { key, key_pair, ocsp: spec.ocsp.clone() })
    }

    /// Whether this host carries TLS-relevant material, used by
    /// `Mux::delete_host` to decide whether a server reload is needed
    /// (spec §9 open question — reload iff TLS-relevant).
    pub fn is_tls_relevant(&self) -> bool {
        self.key_pair.is_some()
    }
}

fn build_certified_key(spec: &KeyPairSpec) -> MuxResult<Arc<CertifiedKey>> {
    let certs = parse_cert(spec.cert_pem.as_bytes())?;
    if certs.is_empty() {
        return Err(MuxError::invalid_argument("key pair has no certificates"));
    }
    let key = parse_key(spec.key_pem.as_bytes())?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| MuxError::invalid_argument(format!("unsupported private key: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn parse_cert(mut cert: &[u8]) -> MuxResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut cert));
    let items: Result<Vec<_>, _> = rustls_pemfile::read_all(&mut reader).collect();
    let items = items.map_err(|e| MuxError::invalid_argument(format!("malformed PEM: {}", e)))?;
    items
        .into_iter()
        .map(|item| match item {
            Item::X509Certificate(der) => Ok(der),
            _ => Err(MuxError::invalid_argument("expected a certificate, found another PEM item")),
        })
        .collect()
}

fn parse_key(mut key: &[u8]) -> MuxResult<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(Cursor::new(&mut key));
    let item = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| MuxError::invalid_argument(format!("malformed PEM: {}", e)))?
        .ok_or_else(|| MuxError::invalid_argument("no private key found"))?;
    match item {
        Item::Pkcs8Key(k) => Ok(PrivateKeyDer::Pkcs8(k)),
        Item::Pkcs1Key(k) => Ok(PrivateKeyDer::Pkcs1(k)),
        Item::Sec1Key(k) => Ok(PrivateKeyDer::Sec1(k)),
        _ => Err(MuxError::invalid_argument("unsupported private key type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A throwaway self-signed cert/key pair, generated once and pinned here
    // as a fixture (ECDSA P-256, SEC1 key, 10-year validity from 2024).
    const TEST_CERT: &str = include_str!("../tests/fixtures/test_cert.pem");
    const TEST_KEY: &str = include_str!("../tests/fixtures/test_key.pem");

    #[test]
    fn host_without_key_pair_is_not_tls_relevant() {
        let host = Host::new(HostKey::from("plain.example.com"), &HostSpec::default()).unwrap();
        assert!(!host.is_tls_relevant());
    }

    #[test]
    fn host_with_key_pair_parses_and_is_tls_relevant() {
        let spec = HostSpec {
            key_pair: Some(KeyPairSpec {
                cert_pem: TEST_CERT.to_string(),
                key_pem: TEST_KEY.to_string(),
            }),
            ocsp: OcspOptions::default(),
        };
        let host = Host::new(HostKey::from("secure.example.com"), &spec).unwrap();
        assert!(host.is_tls_relevant());
    }

    #[test]
    fn malformed_pem_is_invalid_argument() {
        let spec = HostSpec {
            key_pair: Some(KeyPairSpec {
                cert_pem: "not a pem".to_string(),
                key_pem: "also not a pem".to_string(),
            }),
            ocsp: OcspOptions::default(),
        };
        let err = Host::new(HostKey::from("bad.example.com"), &spec).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }
}
