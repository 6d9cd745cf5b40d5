//! Registry snapshot persistence
//!
//! The registry is persisted as a single JSON blob:
//!
//! ```text
//! {
//!   "timelines": { "/users": [ VersionInfo, ... ] },
//!   "tags":      { "stable": VersionTag },
//!   "live":      { "/users": "tsv:..." }
//! }
//! ```
//!
//! Files are written next to their destination and renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, TimescapeError};
use crate::registry::VersionRegistry;
use crate::tag::VersionTag;
use crate::version::{Tsv, VersionInfo};

/// Serialized registry state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub timelines: BTreeMap<String, Vec<VersionInfo>>,
    #[serde(default)]
    pub tags: BTreeMap<String, VersionTag>,
    /// Explicit live bindings per handler
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub live: BTreeMap<String, Tsv>,
}

impl RegistrySnapshot {
    pub fn version_count(&self) -> usize {
        self.timelines.values().map(Vec::len).sum()
    }
}

/// Reads and writes snapshots at a fixed path
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored snapshot; a missing file is an empty registry
    pub fn load(&self) -> Result<RegistrySnapshot> {
        if !self.path.exists() {
            tracing::debug!("No snapshot at {}, starting empty", self.path.display());
            return Ok(RegistrySnapshot::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write a snapshot atomically
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let content = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &content)?;
        tracing::debug!(
            "Wrote snapshot with {} versions to {}",
            snapshot.version_count(),
            self.path.display()
        );
        Ok(())
    }

    /// Copy the registry now and write the copy on the blocking pool
    pub async fn persist_async(&self, registry: &VersionRegistry) -> Result<()> {
        let snapshot = registry.snapshot();
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| TimescapeError::Snapshot(format!("snapshot task failed: {}", e)))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp_path, bytes)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Periodically snapshots the registry until stopped
pub struct SnapshotTask;

impl SnapshotTask {
    pub fn start(
        registry: Arc<VersionRegistry>,
        store: SnapshotStore,
        interval: Duration,
    ) -> SnapshotHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.persist_async(&registry).await {
                            tracing::warn!("Periodic snapshot failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Snapshot task stopped");
        });

        SnapshotHandle { stop_tx, task }
    }
}

/// Handle to stop a running [`SnapshotTask`]
pub struct SnapshotHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl SnapshotHandle {
    /// Stop the task and wait for an in-flight write to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.task.await;
    }
}
