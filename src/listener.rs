//! Listener — a configuration record describing a network endpoint the
//! proxy should bind (spec §3). The live counterpart, a `Server`, is
//! defined in `server.rs`; this module holds the address/protocol/TLS
//! record the Mux keys listeners by.

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Tcp,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp6 => "tcp6",
        }
    }
}

/// `{network, "host:port"}`. Addresses are compared byte-for-byte for
/// uniqueness (spec §6), so this derives a structural `PartialEq`/`Hash`
/// rather than resolving DNS or normalizing the host portion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerAddress {
    pub network: Network,
    pub host_port: String,
}

impl ListenerAddress {
    pub fn new(network: Network, host_port: impl Into<String>) -> Self {
        ListenerAddress { network, host_port: host_port.into() }
    }
}

impl std::fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network.as_str(), self.host_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Https,
}

/// TLS settings for an `Https` listener: a default key pair used when SNI
/// resolution misses (spec §4.2 step 3), and a host predicate (`scope`)
/// limiting which frontends this listener serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub default_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub address: ListenerAddress,
    pub protocol: Protocol,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    /// Host predicate limiting which frontends apply on this listener.
    /// `None` means unscoped (all frontends eligible).
    #[serde(default)]
    pub scope: Option<String>,
}

impl ListenerSpec {
    pub fn validate(&self) -> MuxResult<()> {
        // An HTTPS listener with no `tls.default_host` still resolves
        // per-host by SNI; absence only fails at handshake time for hosts
        // with no material (spec §3 invariant 5), so it isn't rejected here.
        if self.host_port().is_empty() {
            return Err(MuxError::invalid_argument("listener address must not be empty"));
        }
        Ok(())
    }

    pub fn host_port(&self) -> &str {
        &self.address.host_port
    }

    /// Does this listener's `scope` admit requests for `host`? `None`
    /// scope is unscoped and admits every host; a present scope uses the
    /// same wildcard/exact matching as a route predicate's `Host(...)`
    /// clause (spec §3).
    pub fn scope_matches(&self, host: &str) -> bool {
        match &self.scope {
            None => true,
            Some(pattern) => crate::predicate::host_matches(pattern, host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(scope: Option<&str>) -> ListenerSpec {
        ListenerSpec {
            address: ListenerAddress::new(Network::Tcp, "127.0.0.1:0"),
            protocol: Protocol::Http,
            tls: None,
            scope: scope.map(str::to_string),
        }
    }

    #[test]
    fn unscoped_listener_admits_any_host() {
        assert!(spec(None).scope_matches("api.example.com"));
        assert!(spec(None).scope_matches("other.example.org"));
    }

    #[test]
    fn scoped_listener_admits_only_matching_hosts() {
        let s = spec(Some("*.example.com"));
        assert!(s.scope_matches("api.example.com"));
        assert!(!s.scope_matches("api.example.org"));
    }
}
