//! Per-client FIFO queues of canned responses.
//!
//! Queues are keyed by source address. Every mutation snapshots the full
//! map into the write-behind worker while the queue lock is still held, so
//! snapshots reach the worker in mutation order.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use mockgate_core::PresetId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::persist::{PersistConfig, PersistReport, WriteBehind};

/// One queued canned response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresetItem {
    pub id: PresetId,
    pub response: Value,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
}

type Queues = BTreeMap<String, VecDeque<PresetItem>>;

pub struct PresetQueue {
    queues: Mutex<Queues>,
    writer: Option<WriteBehind>,
}

impl PresetQueue {
    /// Queue store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            writer: None,
        }
    }

    /// Load queues from `config.path` and persist further mutations there.
    /// Must be called inside a Tokio runtime.
    pub fn open(config: PersistConfig) -> Self {
        let queues = load(&config.path);
        let (writer, _handle) = WriteBehind::spawn(config);
        Self {
            queues: Mutex::new(queues),
            writer: Some(writer),
        }
    }

    /// Append a response to `ip`'s queue and return its id.
    pub fn add_response(&self, ip: &str, response: Value, status_code: u16) -> PresetId {
        let item = PresetItem {
            id: PresetId::new(),
            response,
            status_code,
            created_at: Utc::now(),
        };
        let id = item.id.clone();
        let mut queues = self.queues.lock();
        queues.entry(ip.to_string()).or_default().push_back(item);
        self.persist(&queues);
        debug!(ip, preset_id = %id, "preset added");
        id
    }

    /// Atomically pop the head of `ip`'s queue, if any.
    pub fn try_take(&self, ip: &str) -> Option<PresetItem> {
        let mut queues = self.queues.lock();
        let item = queues.get_mut(ip)?.pop_front()?;
        self.persist(&queues);
        Some(item)
    }

    pub fn get_queue(&self, ip: &str) -> Vec<PresetItem> {
        self.queues
            .lock()
            .get(ip)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all_queues(&self) -> BTreeMap<String, Vec<PresetItem>> {
        self.queues
            .lock()
            .iter()
            .map(|(ip, q)| (ip.clone(), q.iter().cloned().collect()))
            .collect()
    }

    /// Remove one response by id. Returns whether anything was removed.
    pub fn delete_response(&self, ip: &str, id: &str) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(ip) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|item| item.id.as_str() != id);
        if queue.len() == before {
            return false;
        }
        self.persist(&queues);
        true
    }

    /// Empty `ip`'s queue but keep the key. False if the queue never existed.
    pub fn clear_queue(&self, ip: &str) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(ip) else {
            return false;
        };
        queue.clear();
        self.persist(&queues);
        true
    }

    /// Drop `ip`'s queue entirely. False if the queue never existed.
    pub fn delete_queue(&self, ip: &str) -> bool {
        let mut queues = self.queues.lock();
        if queues.remove(ip).is_none() {
            return false;
        }
        self.persist(&queues);
        true
    }

    pub fn clear_all(&self) {
        let mut queues = self.queues.lock();
        queues.clear();
        self.persist(&queues);
    }

    pub fn queue_length(&self, ip: &str) -> usize {
        self.queues.lock().get(ip).map_or(0, VecDeque::len)
    }

    pub fn persist_status(&self) -> Option<PersistReport> {
        self.writer.as_ref().map(WriteBehind::status)
    }

    /// Write the current state to disk now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        match &self.writer {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    fn persist(&self, queues: &Queues) {
        let Some(writer) = &self.writer else {
            return;
        };
        match serde_json::to_value(queues) {
            Ok(snapshot) => writer.submit(snapshot),
            Err(e) => error!(error = %e, "failed to snapshot preset queues"),
        }
    }
}

/// Missing file yields empty queues; an unreadable or corrupt one is logged
/// and also yields empty queues.
fn load(path: &Path) -> Queues {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Queues::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read preset queues");
            return Queues::new();
        }
    };
    match serde_json::from_str::<Queues>(&raw) {
        Ok(queues) => {
            info!(path = %path.display(), count = queues.len(), "loaded preset queues");
            queues
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "corrupt preset queue file, starting empty");
            Queues::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fifo_per_ip() {
        let store = PresetQueue::in_memory();
        store.add_response("10.0.0.1", json!({"n": 1}), 200);
        store.add_response("10.0.0.1", json!({"n": 2}), 201);
        store.add_response("10.0.0.2", json!({"n": 3}), 200);

        let first = store.try_take("10.0.0.1").unwrap();
        assert_eq!(first.response, json!({"n": 1}));
        assert_eq!(first.status_code, 200);
        let second = store.try_take("10.0.0.1").unwrap();
        assert_eq!(second.status_code, 201);
        assert!(store.try_take("10.0.0.1").is_none());
        assert_eq!(store.queue_length("10.0.0.2"), 1);
    }

    #[test]
    fn take_from_unknown_ip_is_none() {
        let store = PresetQueue::in_memory();
        assert!(store.try_take("1.2.3.4").is_none());
        assert_eq!(store.queue_length("1.2.3.4"), 0);
        assert!(store.get_queue("1.2.3.4").is_empty());
    }

    #[test]
    fn delete_response_by_id() {
        let store = PresetQueue::in_memory();
        let a = store.add_response("ip", json!({"a": 1}), 200);
        store.add_response("ip", json!({"b": 1}), 200);

        assert!(store.delete_response("ip", a.as_str()));
        assert!(!store.delete_response("ip", a.as_str()));
        assert!(!store.delete_response("other", a.as_str()));
        assert_eq!(store.get_queue("ip")[0].response, json!({"b": 1}));
    }

    #[test]
    fn clear_keeps_key_delete_removes_it() {
        let store = PresetQueue::in_memory();
        store.add_response("ip", json!({}), 200);

        assert!(store.clear_queue("ip"));
        assert!(store.get_all_queues().contains_key("ip"));
        assert!(store.delete_queue("ip"));
        assert!(!store.get_all_queues().contains_key("ip"));
        assert!(!store.clear_queue("ip"));
        assert!(!store.delete_queue("ip"));
    }

    #[test]
    fn clear_all_empties_everything() {
        let store = PresetQueue::in_memory();
        store.add_response("a", json!({}), 200);
        store.add_response("b", json!({}), 200);
        store.clear_all();
        assert!(store.get_all_queues().is_empty());
    }

    #[tokio::test]
    async fn persisted_queues_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preset_queues.json");

        let store = PresetQueue::open(PersistConfig::new(&path));
        store.add_response("10.1.1.1", json!({"keep": true}), 202);
        store.add_response("10.1.1.1", json!({"drop": true}), 200);
        store.try_take("10.1.1.1");
        store.flush().await.unwrap();

        let reopened = PresetQueue::open(PersistConfig::new(&path));
        let items = reopened.get_queue("10.1.1.1");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].response, json!({"drop": true}));
        assert!(store.persist_status().unwrap().failures == 0);
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preset_queues.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = PresetQueue::open(PersistConfig::new(&path));
        assert!(store.get_all_queues().is_empty());
    }

    #[tokio::test]
    async fn in_memory_flush_is_noop() {
        let store = PresetQueue::in_memory();
        store.add_response("ip", json!({}), 200);
        store.flush().await.unwrap();
        assert!(store.persist_status().is_none());
    }
}
