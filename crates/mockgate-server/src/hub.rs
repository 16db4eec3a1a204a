use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use mockgate_core::{ConsumerId, ControlEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// One connected operator console.
pub struct Consumer {
    pub id: ConsumerId,
    tx: mpsc::Sender<String>,
    last_pong: AtomicU64,
}

impl Consumer {
    fn new(id: ConsumerId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fan-out of control events to every connected console.
///
/// Delivery is at-most-once and never waits: a consumer whose queue is
/// closed or full is removed on the spot.
pub struct BroadcastHub {
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            consumers: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
        }
    }

    pub fn register(&self) -> (ConsumerId, mpsc::Receiver<String>) {
        let id = ConsumerId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.consumers
            .insert(id.clone(), Arc::new(Consumer::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ConsumerId) -> bool {
        self.consumers.remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.consumers.len()
    }

    /// Send to every consumer. Returns how many accepted the message.
    pub fn broadcast(&self, event: &ControlEvent) -> usize {
        let Some(text) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.consumers.iter() {
            match entry.value().tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => dead.push((entry.key().clone(), failure_kind(&e))),
            }
        }

        // Removal happens after iteration; DashMap shards are still
        // read-locked inside the loop.
        for (id, reason) in dead {
            self.consumers.remove(&id);
            tracing::info!(consumer_id = %id, reason, event = event.event_type(), "Dropped console on failed delivery");
        }
        delivered
    }

    /// Send to a single consumer, removing it if delivery fails.
    pub fn send_to(&self, id: &ConsumerId, event: &ControlEvent) -> bool {
        let Some(text) = encode(event) else {
            return false;
        };
        let Some(consumer) = self.consumers.get(id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        match consumer.tx.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                self.consumers.remove(id);
                tracing::info!(consumer_id = %id, reason = failure_kind(&e), "Dropped console on failed delivery");
                false
            }
        }
    }

    pub fn record_pong(&self, id: &ConsumerId) {
        if let Some(consumer) = self.consumers.get(id) {
            consumer.record_pong();
        }
    }

    /// Remove consumers that haven't answered a ping within the timeout.
    pub fn cleanup_dead_consumers(&self) -> usize {
        let dead: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id) {
                removed += 1;
                tracing::info!(consumer_id = %id, "Cleaned up dead console");
            }
        }
        removed
    }
}

fn encode(event: &ControlEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(event = event.event_type(), error = %e, "Failed to serialize control event");
            None
        }
    }
}

fn failure_kind<T>(e: &TrySendError<T>) -> &'static str {
    match e {
        TrySendError::Full(_) => "queue_full",
        TrySendError::Closed(_) => "closed",
    }
}

/// Drive one console socket: a writer forwarding queued events plus pings,
/// and a reader passing text frames to `on_message` and tracking pongs.
pub async fn handle_ws_connection(
    socket: WebSocket,
    consumer_id: ConsumerId,
    mut rx: mpsc::Receiver<String>,
    hub: Arc<BroadcastHub>,
    on_message: mpsc::Sender<(ConsumerId, String)>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = consumer_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(consumer_id = %writer_cid, "Sent ping");
                }
            }
        }
    });

    let reader_cid = consumer_id.clone();
    let reader_hub = Arc::clone(&hub);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message
                        .send((reader_cid.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_hub.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    hub.unregister(&consumer_id);
    tracing::info!(consumer_id = %consumer_id, "Console disconnected");
}

/// Periodically remove consoles that stopped answering pings.
pub fn start_cleanup_task(
    hub: Arc<BroadcastHub>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = hub.cleanup_dead_consumers();
            if removed > 0 {
                tracing::info!(removed, "Dead console cleanup");
            }
        }
    })
}
