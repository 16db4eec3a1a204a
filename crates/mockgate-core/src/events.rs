use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::BypassCallId;
use crate::request::{CompletedRequest, PendingRequest};

/// Events pushed to every connected operator console.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// A request became the current request and awaits a manual response.
    #[serde(rename = "new_request")]
    NewRequest { data: PendingRequest },

    #[serde(rename = "completed_request")]
    CompletedRequest { data: CompletedRequest },

    #[serde(rename = "queue_updated")]
    QueueUpdated { ip: String },

    #[serde(rename = "all_queues_updated")]
    AllQueuesUpdated,

    #[serde(rename = "bypass_config_updated")]
    BypassConfigUpdated,

    #[serde(rename = "bypass_request")]
    BypassRequest { data: BypassRequestInfo },

    #[serde(rename = "bypass_response")]
    BypassResponse { data: BypassResponseInfo },
}

impl ControlEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewRequest { .. } => "new_request",
            Self::CompletedRequest { .. } => "completed_request",
            Self::QueueUpdated { .. } => "queue_updated",
            Self::AllQueuesUpdated => "all_queues_updated",
            Self::BypassConfigUpdated => "bypass_config_updated",
            Self::BypassRequest { .. } => "bypass_request",
            Self::BypassResponse { .. } => "bypass_response",
        }
    }
}

/// Announced before a bypass request is forwarded upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BypassRequestInfo {
    pub id: BypassCallId,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub request_body: Value,
    pub target_url: String,
}

/// Outcome of a forwarded bypass request, success or failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BypassResponseInfo {
    pub id: BypassCallId,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub response_body: Value,
    pub elapsed_ms: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
