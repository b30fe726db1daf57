use std::fmt;

/// Error kind, tagged on every mutator failure (spec §7 — kinds, not type names).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Conflict,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "notFound",
            ErrorKind::AlreadyExists => "alreadyExists",
            ErrorKind::InvalidArgument => "invalidArgument",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct MuxError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MuxError {
    pub fn not_found(message: impl Into<String>) -> Self {
        MuxError { kind: ErrorKind::NotFound, message: message.into() }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        MuxError { kind: ErrorKind::AlreadyExists, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        MuxError { kind: ErrorKind::InvalidArgument, message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MuxError { kind: ErrorKind::Conflict, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MuxError { kind: ErrorKind::Internal, message: message.into() }
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MuxError {}

pub type MuxResult<T> = Result<T, MuxError>;

/// Dispatch-path failures, mapped to HTTP status codes by the forwarder.
/// Kept separate from `MuxError`: these never reach a mutator, they only
/// ever turn into a response (spec §7: "Request-path failures are mapped
/// to HTTP status codes by the forwarder/middlewares").
#[derive(Debug)]
pub enum ForwardError {
    NoRouteMatch,
    NoUpstream,
    MiddlewareRejected(http::StatusCode, String),
    UpstreamConnect(String),
    UpstreamTimeout,
}

impl ForwardError {
    pub fn status(&self) -> http::StatusCode {
        match self {
            ForwardError::NoRouteMatch => http::StatusCode::NOT_FOUND,
            ForwardError::NoUpstream => http::StatusCode::BAD_GATEWAY,
            ForwardError::MiddlewareRejected(status, _) => *status,
            ForwardError::UpstreamConnect(_) => http::StatusCode::BAD_GATEWAY,
            ForwardError::UpstreamTimeout => http::StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::NoRouteMatch => write!(f, "no route matched"),
            ForwardError::NoUpstream => write!(f, "no upstream available"),
            ForwardError::MiddlewareRejected(status, msg) => {
                write!(f, "middleware rejected ({}): {}", status, msg)
            }
            ForwardError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ForwardError::UpstreamTimeout => write!(f, "upstream timeout"),
        }
    }
}

impl std::error::Error for ForwardError {}
