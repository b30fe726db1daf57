//! Route predicate DSL — a small recursive-descent parser over the
//! `Frontend.route` string (spec §3 leaves the grammar unspecified; this
//! is the SPEC_FULL supplement). Grounded on the teacher's host-matching
//! semantics in `routing::matcher::host_matches`: a leading `*.` matches
//! any subdomain, a trailing `.*` matches any suffix after a fixed prefix.
//!
//! Grammar:
//!   predicate := clause ( "&&" clause )*
//!   clause    := "Host(" string ")" | "PathPrefix(" string ")"
//!              | "Path(" string ")" | "Method(" string ")"
//!   string    := '"' ... '"'

use crate::error::{MuxError, MuxResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Host(String),
    PathPrefix(String),
    Path(String),
    Method(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPredicate {
    pub source: String,
    clauses: Vec<Clause>,
}

impl CompiledPredicate {
    pub fn parse(source: &str) -> MuxResult<Self> {
        let clauses = parse_clauses(source)?;
        if clauses.is_empty() {
            return Err(MuxError::invalid_argument("route predicate has no clauses"));
        }
        Ok(CompiledPredicate { source: source.to_string(), clauses })
    }

    pub fn matches(&self, host: &str, path: &str, method: &str) -> bool {
        self.clauses.iter().all(|c| match c {
            Clause::Host(pattern) => host_matches(pattern, host),
            Clause::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
            Clause::Path(exact) => path == exact,
            Clause::Method(m) => m.eq_ignore_ascii_case(method),
        })
    }
}

/// Host-wildcard matching: `*.example.com` matches any subdomain,
/// `api.*` matches any suffix after `api.`, otherwise exact match.
/// Shared with `listener::ListenerSpec::scope_matches`.
pub(crate) fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.split(':').next().unwrap_or(host);
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.len() > suffix.len() && host.ends_with(suffix) && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return host.starts_with(prefix) && host.len() > prefix.len();
    }
    pattern.eq_ignore_ascii_case(host)
}

fn parse_clauses(source: &str) -> MuxResult<Vec<Clause>> {
    source
        .split("&&")
        .map(|part| parse_clause(part.trim()))
        .collect()
}

fn parse_clause(part: &str) -> MuxResult<Clause> {
    let (name, rest) = part
        .split_once('(')
        .ok_or_else(|| MuxError::invalid_argument(format!("malformed route predicate clause: {:?}", part)))?;
    let rest = rest
        .strip_suffix(')')
        .ok_or_else(|| MuxError::invalid_argument(format!("malformed route predicate clause: {:?}", part)))?;
    let arg = rest
        .trim()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| MuxError::invalid_argument(format!("expected a quoted string argument in {:?}", part)))?
        .to_string();

    match name.trim() {
        "Host" => Ok(Clause::Host(arg)),
        "PathPrefix" => Ok(Clause::PathPrefix(arg)),
        "Path" => Ok(Clause::Path(arg)),
        "Method" => Ok(Clause::Method(arg)),
        other => Err(MuxError::invalid_argument(format!("unknown route predicate clause: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_matches() {
        let p = CompiledPredicate::parse(r#"Host("api.example.com")"#).unwrap();
        assert!(p.matches("api.example.com", "/", "GET"));
        assert!(!p.matches("other.example.com", "/", "GET"));
    }

    #[test]
    fn wildcard_subdomain_host_matches() {
        let p = CompiledPredicate::parse(r#"Host("*.example.com")"#).unwrap();
        assert!(p.matches("api.example.com", "/", "GET"));
        assert!(!p.matches("example.com", "/", "GET"));
    }

    #[test]
    fn combined_clauses_require_all() {
        let p = CompiledPredicate::parse(r#"Host("api.example.com") && PathPrefix("/v1")"#).unwrap();
        assert!(p.matches("api.example.com", "/v1/users", "GET"));
        assert!(!p.matches("api.example.com", "/v2/users", "GET"));
    }

    #[test]
    fn method_clause_is_case_insensitive() {
        let p = CompiledPredicate::parse(r#"Method("post")"#).unwrap();
        assert!(p.matches("any", "/", "POST"));
    }

    #[test]
    fn malformed_predicate_is_rejected() {
        assert!(CompiledPredicate::parse("not a predicate").is_err());
        assert!(CompiledPredicate::parse("Unknown(\"x\")").is_err());
    }
}
