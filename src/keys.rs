//! Typed, cheaply-clonable key wrappers. Every entity is addressed by a
//! typed key rather than a bare `String` (spec §3), following the
//! `Arc<str>`-interning idiom used for `scheme`/`pass_host`/`upstream_host`
//! in the teacher's cluster config.

use std::fmt;
use std::sync::Arc;

macro_rules! key_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Arc<str>);

        impl $name {
            pub fn new(s: impl Into<Arc<str>>) -> Self {
                $name(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(Arc::from(s))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(Arc::from(s.as_str()))
            }
        }
    };
}

key_type!(HostKey);
key_type!(ListenerKey);
key_type!(BackendKey);
key_type!(FrontendKey);

/// `ServerKey{backendKey, id}` — servers are scoped to their backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub backend: BackendKey,
    pub id: Arc<str>,
}

impl ServerKey {
    pub fn new(backend: BackendKey, id: impl Into<Arc<str>>) -> Self {
        ServerKey { backend, id: id.into() }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend, self.id)
    }
}

/// `MiddlewareKey{frontendKey, id}` — middlewares are scoped to their frontend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiddlewareKey {
    pub frontend: FrontendKey,
    pub id: Arc<str>,
}

impl MiddlewareKey {
    pub fn new(frontend: FrontendKey, id: impl Into<Arc<str>>) -> Self {
        MiddlewareKey { frontend, id: id.into() }
    }
}

impl fmt::Display for MiddlewareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.frontend, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_equality_is_value_based() {
        assert_eq!(HostKey::from("api.example.com"), HostKey::from("api.example.com".to_string()));
    }

    #[test]
    fn server_key_scopes_by_backend() {
        let a = ServerKey::new(BackendKey::from("b1"), "s1");
        let b = ServerKey::new(BackendKey::from("b2"), "s1");
        assert_ne!(a, b);
    }
}
