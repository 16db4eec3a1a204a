use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use mockgate_core::{Headers, UpstreamError};

use crate::forwarder::{ForwardTarget, ForwardedResponse, Forwarder};

/// Pre-programmed upstream outcomes for deterministic tests without a
/// network.
pub enum MockReply {
    Json(u16, Value),
    Error(UpstreamError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn ok(body: Value) -> Self {
        Self::Json(200, body)
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One call the mock received.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub url: String,
    pub body: Value,
    pub headers: Headers,
}

/// Forwarder that returns pre-programmed replies in sequence.
pub struct MockForwarder {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockForwarder {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward(
        &self,
        target: &ForwardTarget,
        body: &Value,
        headers: &Headers,
    ) -> Result<ForwardedResponse, UpstreamError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            url: target.url.clone(),
            body: body.clone(),
            headers: headers.clone(),
        });

        let Some(reply) = self.replies.get(idx) else {
            return Err(UpstreamError::Unexpected(format!(
                "MockForwarder: no reply configured for call {idx}"
            )));
        };

        let start = tokio::time::Instant::now();
        let mut current = reply;
        loop {
            match current {
                MockReply::Json(status_code, body) => {
                    return Ok(ForwardedResponse {
                        body: body.clone(),
                        status_code: *status_code,
                        elapsed: start.elapsed(),
                    });
                }
                MockReply::Error(e) => return Err(e.clone()),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(*duration).await;
                    current = inner;
                }
            }
        }
    }
}
