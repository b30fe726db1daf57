//! `Headers` middleware — request/response header add/set/remove.
//! Grounded on the teacher's `routing::radix_tree::{HeaderOp,
//! HeaderOpAction}` pre-compiled transform list, generalized from a
//! per-route config table to a standalone middleware variant.

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};
use crate::forwarder::BoxBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOpAction {
    Set,
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOpSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderOpAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderTransformSpec {
    #[serde(default)]
    pub request: Vec<HeaderOpSpec>,
    #[serde(default)]
    pub response: Vec<HeaderOpSpec>,
}

/// A single compiled header mutation: the header name is parsed once at
/// build time so the hot path never re-validates it.
pub struct HeaderOp {
    name: HeaderName,
    value: HeaderValue,
    action: HeaderOpAction,
}

pub struct HeaderTransform {
    request_ops: Vec<HeaderOp>,
    response_ops: Vec<HeaderOp>,
}

impl HeaderTransform {
    pub fn new(spec: HeaderTransformSpec) -> MuxResult<Self> {
        Ok(HeaderTransform {
            request_ops: compile(spec.request)?,
            response_ops: compile(spec.response)?,
        })
    }

    pub fn on_request(&self, mut req: Request<BoxBody>) -> Request<BoxBody> {
        apply(req.headers_mut(), &self.request_ops);
        req
    }

    pub fn on_response(&self, mut resp: Response<BoxBody>) -> Response<BoxBody> {
        apply(resp.headers_mut(), &self.response_ops);
        resp
    }
}

fn compile(ops: Vec<HeaderOpSpec>) -> MuxResult<Vec<HeaderOp>> {
    ops.into_iter()
        .map(|op| {
            let name = HeaderName::from_bytes(op.name.as_bytes())
                .map_err(|e| MuxError::invalid_argument(format!("invalid header name {:?}: {}", op.name, e)))?;
            let value = HeaderValue::from_str(&op.value)
                .map_err(|e| MuxError::invalid_argument(format!("invalid header value {:?}: {}", op.value, e)))?;
            Ok(HeaderOp { name, value, action: op.action })
        })
        .collect()
}

fn apply(headers: &mut hyper::HeaderMap, ops: &[HeaderOp]) {
    for op in ops {
        match op.action {
            HeaderOpAction::Remove => {
                headers.remove(&op.name);
            }
            HeaderOpAction::Set => {
                headers.insert(op.name.clone(), op.value.clone());
            }
            HeaderOpAction::Add => {
                headers.append(op.name.clone(), op.value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::empty_body;

    fn spec(action: HeaderOpAction) -> HeaderTransformSpec {
        HeaderTransformSpec {
            request: vec![HeaderOpSpec { name: "x-mux".to_string(), value: "1".to_string(), action }],
            response: vec![],
        }
    }

    #[test]
    fn set_inserts_a_header() {
        let t = HeaderTransform::new(spec(HeaderOpAction::Set)).unwrap();
        let req = Request::builder().body(empty_body()).unwrap();
        let req = t.on_request(req);
        assert_eq!(req.headers().get("x-mux").unwrap(), "1");
    }

    #[test]
    fn remove_drops_an_existing_header() {
        let t = HeaderTransform::new(HeaderTransformSpec {
            request: vec![HeaderOpSpec { name: "x-mux".to_string(), value: String::new(), action: HeaderOpAction::Remove }],
            response: vec![],
        })
        .unwrap();
        let mut req = Request::builder().body(empty_body()).unwrap();
        req.headers_mut().insert("x-mux", "1".parse().unwrap());
        let req = t.on_request(req);
        assert!(req.headers().get("x-mux").is_none());
    }

    #[test]
    fn invalid_header_name_is_rejected_at_build_time() {
        let spec = HeaderTransformSpec {
            request: vec![HeaderOpSpec { name: "bad header".to_string(), value: "1".to_string(), action: HeaderOpAction::Set }],
            response: vec![],
        };
        assert!(HeaderTransform::new(spec).is_err());
    }
}
