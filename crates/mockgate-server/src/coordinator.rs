//! Manual-mode request coordinator.
//!
//! Inbound requests queue in arrival order and are announced to operator
//! consoles one at a time. Each submission owns a [`ResolutionCell`]; the
//! first of resolve, cancel, or timeout to complete it wins and every later
//! attempt is a no-op. All state sits behind one mutex that is never held
//! across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use mockgate_core::{CompletedRequest, ConsumerId, ControlEvent, PendingRequest, RequestId, RequestStatus};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::hub::BroadcastHub;
use crate::watcher::{ConnectionLiveness, DisconnectWatcher};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long a caller waits for an operator.
    pub timeout: Duration,
    pub disconnect_poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            disconnect_poll_interval: Duration::from_secs(1),
        }
    }
}

/// How a submission ended.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolutionOutcome {
    Resolved { body: Value, status_code: u16 },
    Cancelled { reason: String },
    TimedOut,
}

/// Single-shot completion slot. The sender can be taken once, which makes
/// completion a compare-and-set.
struct ResolutionCell {
    tx: Option<oneshot::Sender<ResolutionOutcome>>,
}

impl ResolutionCell {
    fn new(tx: oneshot::Sender<ResolutionOutcome>) -> Self {
        Self { tx: Some(tx) }
    }

    fn is_pending(&self) -> bool {
        self.tx.is_some()
    }

    fn complete(&mut self, outcome: ResolutionOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver may already be gone if the caller was dropped.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    current: Option<PendingRequest>,
    queue: VecDeque<PendingRequest>,
    table: HashMap<RequestId, ResolutionCell>,
}

impl CoordinatorState {
    fn is_current(&self, id: &RequestId) -> bool {
        self.current.as_ref().is_some_and(|r| &r.id == id)
    }

    /// Complete a cell and drop the request from the queue if it never got
    /// announced.
    fn complete(&mut self, id: &RequestId, outcome: ResolutionOutcome) -> bool {
        let Some(cell) = self.table.get_mut(id) else {
            return false;
        };
        if !cell.complete(outcome) {
            return false;
        }
        self.queue.retain(|r| &r.id != id);
        true
    }
}

/// Point-in-time view of coordinator state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub current: Option<RequestId>,
    pub queued: Vec<RequestId>,
    pub live_cells: usize,
}

pub struct RequestCoordinator {
    state: Mutex<CoordinatorState>,
    hub: Arc<BroadcastHub>,
    config: CoordinatorConfig,
}

impl RequestCoordinator {
    pub fn new(hub: Arc<BroadcastHub>, config: CoordinatorConfig) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            hub,
            config,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Queue `request` and wait until an operator answers it, the caller
    /// disconnects, or the timeout elapses. Dropping the returned future
    /// cleans up exactly like returning does.
    pub async fn submit<L: ConnectionLiveness>(
        self: &Arc<Self>,
        request: PendingRequest,
        liveness: L,
    ) -> ResolutionOutcome {
        let id = request.id.clone();
        let (tx, mut rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            state.table.insert(id.clone(), ResolutionCell::new(tx));
            state.queue.push_back(request);
            debug!(request_id = %id, queued = state.queue.len(), "Request queued for manual response");
            self.advance_locked(&mut state);
        }

        // Drop order: watcher stops first, then the guard cleans up.
        let _guard = SubmissionGuard {
            coordinator: self,
            id: id.clone(),
        };
        let _watcher = DisconnectWatcher::spawn(
            Arc::clone(self),
            id.clone(),
            liveness,
            self.config.disconnect_poll_interval,
        );

        let waited = tokio::time::timeout(self.config.timeout, &mut rx).await;
        let received = match waited {
            Ok(received) => received,
            Err(_) => {
                if self.state.lock().complete(&id, ResolutionOutcome::TimedOut) {
                    warn!(request_id = %id, timeout_secs = self.config.timeout.as_secs(), "Timed out waiting for manual response");
                }
                // Whichever path completed the cell first has already sent.
                rx.await
            }
        };

        received.unwrap_or_else(|_| ResolutionOutcome::Cancelled {
            reason: "resolution dropped".into(),
        })
    }

    /// Announce the queue head if nothing is current. Returns the id
    /// announced, if any.
    pub fn advance(&self) -> Option<RequestId> {
        let mut state = self.state.lock();
        self.advance_locked(&mut state)
    }

    fn advance_locked(&self, state: &mut CoordinatorState) -> Option<RequestId> {
        if state.current.is_some() {
            return None;
        }
        while let Some(mut next) = state.queue.pop_front() {
            if !state.table.get(&next.id).is_some_and(ResolutionCell::is_pending) {
                continue;
            }
            next.status = RequestStatus::InFlight;
            let id = next.id.clone();
            self.hub.broadcast(&ControlEvent::NewRequest { data: next.clone() });
            info!(request_id = %id, client_ip = %next.source_address, "Announced request to operators");
            state.current = Some(next);
            return Some(id);
        }
        None
    }

    /// Answer the announced request. False when `id` is unknown, already
    /// finished, or not the current request.
    pub fn resolve(&self, id: &RequestId, body: Value, status_code: u16) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(id) {
            debug!(request_id = %id, "Ignoring response for request that is not current");
            return false;
        }
        let outcome = ResolutionOutcome::Resolved {
            body: body.clone(),
            status_code,
        };
        if !state.complete(id, outcome) {
            debug!(request_id = %id, "Ignoring response for finished request");
            return false;
        }

        if let Some(current) = state.current.as_mut() {
            current.status = RequestStatus::Resolved;
            let completed = CompletedRequest::answered(current, body, status_code);
            self.hub.broadcast(&ControlEvent::CompletedRequest { data: completed });
        }
        if state.is_current(id) {
            state.current = None;
        }
        info!(request_id = %id, status_code, "Request resolved by operator");
        self.advance_locked(&mut state);
        true
    }

    /// Cancel a queued or announced request. Leaves `current` for the
    /// submitter's cleanup to clear.
    pub fn cancel(&self, id: &RequestId, reason: &str) -> bool {
        let mut state = self.state.lock();
        let cancelled = state.complete(
            id,
            ResolutionOutcome::Cancelled {
                reason: reason.to_string(),
            },
        );
        if cancelled {
            if let Some(current) = state.current.as_mut().filter(|r| &r.id == id) {
                current.status = RequestStatus::Cancelled;
            }
            info!(request_id = %id, reason, "Request cancelled");
        } else {
            debug!(request_id = %id, "Cancel ignored for unknown or finished request");
        }
        cancelled
    }

    /// Register a console and replay the current request to it alone.
    pub fn attach_consumer(&self) -> (ConsumerId, mpsc::Receiver<String>) {
        // Holding the state lock keeps the replay consistent with the next
        // announcement.
        let state = self.state.lock();
        let (id, rx) = self.hub.register();
        if let Some(current) = &state.current {
            self.hub.send_to(
                &id,
                &ControlEvent::NewRequest {
                    data: current.clone(),
                },
            );
        }
        (id, rx)
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock();
        CoordinatorSnapshot {
            current: state.current.as_ref().map(|r| r.id.clone()),
            queued: state.queue.iter().map(|r| r.id.clone()).collect(),
            live_cells: state.table.len(),
        }
    }

    fn finish(&self, id: &RequestId) {
        let mut state = self.state.lock();
        state.table.remove(id);
        state.queue.retain(|r| &r.id != id);
        if state.is_current(id) {
            state.current = None;
        }
        self.advance_locked(&mut state);
    }
}

/// Runs cleanup when `submit` returns or its future is dropped.
struct SubmissionGuard<'a> {
    coordinator: &'a RequestCoordinator,
    id: RequestId,
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.finish(&self.id);
    }
}
