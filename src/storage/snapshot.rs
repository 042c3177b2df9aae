//! Snapshot persistence for fast restart
//!
//! The whole [`MemoryStore`] is written as one JSON document. Writes go to a
//! temporary file that is renamed over the previous snapshot, so a crash
//! mid-write leaves the last good snapshot in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::store::{MemoryStore, StoreSnapshot, TraceStore};

const SNAPSHOT_FILE: &str = "tracehub.snapshot.json";
const SCHEMA_VERSION: u32 = 1;

/// Snapshot metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMetadata {
    /// Creation timestamp (epoch ms)
    pub created_at: i64,
    pub batches: usize,
    pub traces: usize,
    pub spans: usize,
    pub size_bytes: usize,
    /// Schema version for compatibility
    pub schema_version: u32,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotFile {
    metadata: SnapshotMetadata,
    store: StoreSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unsupported snapshot schema version {0}")]
    UnsupportedVersion(u32),
}

/// Saves and restores store snapshots in a data directory
pub struct SnapshotManager {
    data_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, PersistenceError> {
        fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Write a snapshot of the store
    pub fn save(&self, store: &MemoryStore) -> Result<SnapshotMetadata, PersistenceError> {
        let snapshot = store.snapshot();
        let mut metadata = SnapshotMetadata {
            created_at: chrono::Utc::now().timestamp_millis(),
            batches: snapshot.batches.len(),
            traces: snapshot.traces.len(),
            spans: snapshot.spans.len(),
            size_bytes: 0,
            schema_version: SCHEMA_VERSION,
        };
        let file = SnapshotFile {
            metadata: metadata.clone(),
            store: snapshot,
        };

        let data = serde_json::to_vec(&file)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        metadata.size_bytes = data.len();

        let tmp = self.data_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, self.snapshot_path())?;

        Ok(metadata)
    }

    /// Load the latest snapshot, if one exists
    pub fn restore(&self) -> Result<Option<MemoryStore>, PersistenceError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        let file: SnapshotFile = serde_json::from_slice(&data)
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        if file.metadata.schema_version != SCHEMA_VERSION {
            return Err(PersistenceError::UnsupportedVersion(
                file.metadata.schema_version,
            ));
        }

        tracing::info!(
            "Restored snapshot: {} batches, {} traces, {} spans",
            file.metadata.batches,
            file.metadata.traces,
            file.metadata.spans
        );
        Ok(Some(MemoryStore::from_snapshot(file.store)))
    }
}

/// Periodically snapshots the store
pub struct SnapshotWorker {
    store: Arc<MemoryStore>,
    manager: Arc<SnapshotManager>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl SnapshotWorker {
    pub fn new(store: Arc<MemoryStore>, manager: Arc<SnapshotManager>, interval: Duration) -> Self {
        Self {
            store,
            manager,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Snapshot worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);
            // first tick fires immediately
            interval.tick().await;

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                self.save_now();
            }

            tracing::info!("Snapshot worker stopped");
        })
    }

    /// Take a snapshot immediately, logging failures
    pub fn save_now(&self) {
        let counts = self.store.counts();
        match self.manager.save(&self.store) {
            Ok(meta) => tracing::debug!(
                batches = counts.batches,
                traces = counts.traces,
                size_bytes = meta.size_bytes,
                "Snapshot written"
            ),
            Err(e) => tracing::error!("Snapshot failed: {}", e),
        }
    }

    /// Stop the worker
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
