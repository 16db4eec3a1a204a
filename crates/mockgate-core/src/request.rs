use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use serde_json::Value;

use crate::ids::RequestId;

pub const DEFAULT_METHOD: &str = "POST";
pub const DEFAULT_PATH: &str = "/v1/chat/completions";

/// Request headers in arrival order, names lowercased.
pub type Headers = IndexMap<String, String>;

/// Lifecycle of a request held for manual resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    InFlight,
    Resolved,
    Cancelled,
}

/// An inbound request awaiting a manual response.
///
/// The wire form keeps the field names operator consoles already read
/// (`ip`, `port`, `timestamp`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RequestId,
    #[serde(rename = "ip")]
    pub source_address: String,
    #[serde(rename = "port")]
    pub source_port: u16,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Value,
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl PendingRequest {
    pub fn new(source_address: impl Into<String>, source_port: u16, body: Value) -> Self {
        Self {
            id: RequestId::new(),
            source_address: source_address.into(),
            source_port,
            method: DEFAULT_METHOD.to_string(),
            path: DEFAULT_PATH.to_string(),
            headers: Headers::new(),
            body,
            enqueued_at: Utc::now(),
            status: RequestStatus::Pending,
        }
    }

    pub fn with_route(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = method.into();
        self.path = path.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// History record sent to consoles once a request has been answered,
/// whether by an operator or from a preset queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedRequest {
    pub id: RequestId,
    pub ip: String,
    pub port: u16,
    pub body: Value,
    pub response: Value,
    pub status_code: u16,
}

impl CompletedRequest {
    pub fn answered(request: &PendingRequest, response: Value, status_code: u16) -> Self {
        Self {
            id: request.id.clone(),
            ip: request.source_address.clone(),
            port: request.source_port,
            body: request.body.clone(),
            response,
            status_code,
        }
    }
}
