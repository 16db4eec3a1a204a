use std::time::Duration;

/// Failure while forwarding a request to the real upstream in bypass mode.
/// Always surfaced to the HTTP caller as a 502, never propagated further.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Request timeout after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl UpstreamError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect { .. } => "connect",
            Self::Http(_) => "http",
            Self::Unexpected(_) => "unexpected",
        }
    }

    /// HTTP status reported to the original caller.
    pub fn status_code(&self) -> u16 {
        502
    }
}

/// A control-channel message the coordinator cannot act on. Logged and
/// dropped; the operator connection stays open.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("malformed control message: {0}")]
    Malformed(String),
    #[error("unsupported control message type: {0}")]
    UnknownType(String),
    #[error("status code out of range: {0}")]
    InvalidStatus(u64),
}

impl ProtocolViolation {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidStatus(_) => "invalid_status",
        }
    }
}
