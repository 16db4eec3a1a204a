use std::sync::Arc;
use std::time::Duration;

use mockgate_core::RequestId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::coordinator::RequestCoordinator;

pub const DISCONNECT_REASON: &str = "client disconnected";

/// Probe for whether the caller behind a held request is still there.
pub trait ConnectionLiveness: Send + Sync + 'static {
    fn is_disconnected(&self) -> bool;
}

/// The HTTP layer cancels this token from a drop guard owned by the request
/// handler, so a dropped handler reads as a disconnect.
impl ConnectionLiveness for CancellationToken {
    fn is_disconnected(&self) -> bool {
        self.is_cancelled()
    }
}

/// Background poller for one held request. Stops when dropped.
pub struct DisconnectWatcher {
    _stop: DropGuard,
}

impl DisconnectWatcher {
    pub fn spawn<L: ConnectionLiveness>(
        coordinator: Arc<RequestCoordinator>,
        id: RequestId,
        liveness: L,
        poll_interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if liveness.is_disconnected() {
                    tracing::info!(request_id = %id, "Caller disconnected while waiting");
                    coordinator.cancel(&id, DISCONNECT_REASON);
                    return;
                }
            }
        });

        Self {
            _stop: stop.drop_guard(),
        }
    }
}
