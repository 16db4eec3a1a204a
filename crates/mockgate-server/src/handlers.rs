//! The intercepted completion endpoint and control-channel dispatch.
//!
//! Each inbound request is answered by exactly one strategy, checked in
//! order: bypass forwarding, the caller's preset queue, then an operator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use mockgate_core::events::{BypassRequestInfo, BypassResponseInfo};
use mockgate_core::{
    BypassCallId, CompletedRequest, ConsumerId, ControlEvent, Headers, PendingRequest,
};
use mockgate_store::{BypassConfigStore, PresetQueue};
use mockgate_upstream::{ForwardTarget, Forwarder};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::{parse_control_message, ControlMessage};
use crate::coordinator::{RequestCoordinator, ResolutionOutcome};
use crate::server::AppState;

pub const CANCELLED_MESSAGE: &str = "Request cancelled - client disconnected";
pub const TIMEOUT_MESSAGE: &str = "Timeout waiting for mock response";

/// Shared state available to all handlers.
pub struct HandlerState {
    pub coordinator: Arc<RequestCoordinator>,
    pub presets: Arc<PresetQueue>,
    pub bypass: Arc<BypassConfigStore>,
    pub forwarder: Arc<dyn Forwarder>,
}

impl HandlerState {
    pub fn new(
        coordinator: Arc<RequestCoordinator>,
        presets: Arc<PresetQueue>,
        bypass: Arc<BypassConfigStore>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            coordinator,
            presets,
            bypass,
            forwarder,
        }
    }

    pub fn broadcast(&self, event: &ControlEvent) -> usize {
        self.coordinator.hub().broadcast(event)
    }
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(client_ip = %peer.ip(), error = %e, "Rejected non-JSON request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("Invalid JSON body: {e}") })),
            )
                .into_response();
        }
    };
    let headers = header_map(&headers);
    let client_ip = peer.ip().to_string();
    let hs = &state.handler_state;

    if hs.bypass.is_enabled() {
        return forward_bypass(hs, body, &headers, &client_ip).await;
    }

    if let Some(item) = hs.presets.try_take(&client_ip) {
        tracing::info!(client_ip = %client_ip, status_code = item.status_code, "Answered from preset queue");
        hs.broadcast(&ControlEvent::QueueUpdated {
            ip: client_ip.clone(),
        });
        let request = PendingRequest::new(&client_ip, peer.port(), body);
        hs.broadcast(&ControlEvent::CompletedRequest {
            data: CompletedRequest::answered(&request, item.response.clone(), item.status_code),
        });
        return json_response(item.status_code, item.response);
    }

    let request = PendingRequest::new(&client_ip, peer.port(), body)
        .with_route("POST", uri.path())
        .with_headers(headers);
    let request_id = request.id.clone();

    // The wait runs in its own task so it outlives this handler. When hyper
    // drops the handler (caller gone) the guard cancels the token and the
    // disconnect watcher cancels the request.
    let liveness = CancellationToken::new();
    let _disconnect = liveness.clone().drop_guard();
    let coordinator = Arc::clone(&hs.coordinator);
    let waiting = tokio::spawn(async move { coordinator.submit(request, liveness).await });

    let outcome = match waiting.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Manual wait task failed");
            ResolutionOutcome::Cancelled {
                reason: e.to_string(),
            }
        }
    };

    match outcome {
        ResolutionOutcome::Resolved { body, status_code } => json_response(status_code, body),
        ResolutionOutcome::Cancelled { reason } => {
            tracing::warn!(request_id = %request_id, reason = %reason, "Request cancelled");
            json_response(499, json!({ "error": CANCELLED_MESSAGE }))
        }
        ResolutionOutcome::TimedOut => {
            tracing::warn!(request_id = %request_id, "Request timed out");
            (StatusCode::GATEWAY_TIMEOUT, Json(json!({ "error": TIMEOUT_MESSAGE }))).into_response()
        }
    }
}

async fn forward_bypass(
    hs: &HandlerState,
    body: Value,
    headers: &Headers,
    client_ip: &str,
) -> Response {
    let target = ForwardTarget::from(&hs.bypass.get());
    let call_id = BypassCallId::new();
    tracing::info!(client_ip, target_url = %target.url, "Forwarding request upstream");

    hs.broadcast(&ControlEvent::BypassRequest {
        data: BypassRequestInfo {
            id: call_id.clone(),
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            request_body: body.clone(),
            target_url: target.url.clone(),
        },
    });

    let start = Instant::now();
    match hs.forwarder.forward(&target, &body, headers).await {
        Ok(resp) => {
            hs.broadcast(&ControlEvent::BypassResponse {
                data: BypassResponseInfo {
                    id: call_id,
                    timestamp: Utc::now(),
                    status_code: resp.status_code,
                    response_body: resp.body.clone(),
                    elapsed_ms: resp.elapsed.as_secs_f64() * 1000.0,
                    success: true,
                    error: None,
                },
            });
            json_response(resp.status_code, resp.body)
        }
        Err(e) => {
            let message = e.to_string();
            let error_body = json!({ "error": message });
            hs.broadcast(&ControlEvent::BypassResponse {
                data: BypassResponseInfo {
                    id: call_id,
                    timestamp: Utc::now(),
                    status_code: e.status_code(),
                    response_body: error_body.clone(),
                    elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                    success: false,
                    error: Some(message),
                },
            });
            json_response(e.status_code(), error_body)
        }
    }
}

fn json_response(status_code: u16, body: Value) -> Response {
    let status = StatusCode::from_u16(status_code).unwrap_or_else(|_| {
        tracing::warn!(status_code, "Invalid status code, answering 500");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    (status, Json(body)).into_response()
}

/// Header names come out of `http` lowercased and in arrival order. A
/// repeated name keeps its first position with values joined by `", "`.
/// Non-UTF-8 values are skipped.
fn header_map(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// Apply operator messages arriving over the control channel.
pub async fn process_control_messages(
    mut rx: mpsc::Receiver<(ConsumerId, String)>,
    coordinator: Arc<RequestCoordinator>,
) {
    while let Some((consumer_id, raw)) = rx.recv().await {
        match parse_control_message(&raw) {
            Ok(ControlMessage::SendResponse {
                id,
                status_code,
                response,
            }) => {
                if !coordinator.resolve(&id, response, status_code) {
                    tracing::debug!(consumer_id = %consumer_id, request_id = %id, "Stale response ignored");
                }
            }
            Err(violation) => {
                tracing::warn!(
                    consumer_id = %consumer_id,
                    kind = violation.error_kind(),
                    error = %violation,
                    "Ignoring control message"
                );
            }
        }
    }
}
