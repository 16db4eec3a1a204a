//! Write-behind persistence for in-memory state.
//!
//! Mutations hand the latest JSON snapshot to a `watch` channel; a single
//! writer task persists whatever is newest, so bursts of mutations coalesce
//! into one write. Each snapshot is retried a bounded number of times and
//! failures are counted rather than silently lost.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::StoreError;

#[derive(Clone, Debug)]
pub struct PersistConfig {
    pub path: PathBuf,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl PersistConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Counters exposed on `/health` so persistence failures are visible.
#[derive(Default)]
pub struct PersistStatus {
    writes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub writes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl PersistStatus {
    fn record_success(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, err: &StoreError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(err.to_string());
    }

    pub fn report(&self) -> PersistReport {
        PersistReport {
            writes: self.writes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Handle to the write-behind worker. Dropping every handle lets the worker
/// drain the last snapshot and exit.
pub struct WriteBehind {
    tx: watch::Sender<Option<Value>>,
    config: PersistConfig,
    status: Arc<PersistStatus>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl WriteBehind {
    /// Spawn the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(config: PersistConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);
        let status = Arc::new(PersistStatus::default());
        let write_lock = Arc::new(tokio::sync::Mutex::new(()));

        let handle = tokio::spawn(run_writer(
            rx,
            config.clone(),
            Arc::clone(&status),
            Arc::clone(&write_lock),
        ));

        (
            Self {
                tx,
                config,
                status,
                write_lock,
            },
            handle,
        )
    }

    /// Queue a snapshot for writing. Never blocks; replaces any snapshot
    /// the worker has not picked up yet.
    pub fn submit(&self, snapshot: Value) {
        self.tx.send_replace(Some(snapshot));
    }

    /// Write the newest snapshot now, bypassing the worker.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.tx.borrow().clone();
        match snapshot {
            Some(value) => {
                let result = write_json(self.config.path.clone(), value).await;
                match &result {
                    Ok(()) => self.status.record_success(),
                    Err(e) => self.status.record_failure(e),
                }
                result
            }
            None => Ok(()),
        }
    }

    pub fn status(&self) -> PersistReport {
        self.status.report()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

async fn run_writer(
    mut rx: watch::Receiver<Option<Value>>,
    config: PersistConfig,
    status: Arc<PersistStatus>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
) {
    while rx.changed().await.is_ok() {
        // Read the snapshot under the write lock so a concurrent flush can
        // never be overwritten by an older value.
        let _guard = write_lock.lock().await;
        let Some(snapshot) = rx.borrow_and_update().clone() else {
            continue;
        };
        write_with_retry(&config, &status, snapshot).await;
    }
    debug!(path = %config.path.display(), "persistence writer stopped");
}

async fn write_with_retry(config: &PersistConfig, status: &PersistStatus, snapshot: Value) {
    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        match write_json(config.path.clone(), snapshot.clone()).await {
            Ok(()) => {
                status.record_success();
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    path = %config.path.display(),
                    attempt,
                    error = %e,
                    "snapshot write failed, retrying"
                );
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => {
                error!(
                    path = %config.path.display(),
                    attempts,
                    error = %e,
                    "giving up on snapshot write"
                );
                status.record_failure(&e);
            }
        }
    }
}

async fn write_json(path: PathBuf, value: Value) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || write_json_atomic(&path, &value))
        .await
        .map_err(|e| StoreError::Io(e.to_string()))?
}

/// Pretty-printed JSON written to a sibling temp file and renamed into place.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
