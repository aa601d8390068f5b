//! Periodic snapshot of the full projection, plus startup integrity
//! checks (spec §4.D).

use std::path::{Path, PathBuf};

use flyback_types::ProjectionState;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::primitives::{atomic_write, FileLock, StorageError};

/// A full, atomic dump of projection state plus the `seq` it reflects
/// (GLOSSARY "Snapshot").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// `seq` of the last event folded into `state`.
    pub snapshot_seq: u64,
    /// The captured projection state.
    pub state: ProjectionState,
}

/// Errors specific to snapshot load-time integrity checks (spec §7 "Fatal
/// integrity violations... snapshot ahead of log").
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Storage-layer I/O failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The snapshot claims to reflect a `seq` beyond the log's own
    /// frontier — the two files have diverged in an unrecoverable way.
    #[error("snapshot_seq {snapshot_seq} is ahead of the log's last_seq {log_last_seq}")]
    AheadOfLog { snapshot_seq: u64, log_last_seq: u64 },
}

/// Persists and loads the single-file projection snapshot under an
/// advisory lock.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Open the snapshot store rooted at `dir` (file is `dir/snapshot.json`).
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join("snapshot.json") }
    }

    /// Write `snapshot` atomically under the snapshot lock.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let _lock = FileLock::acquire_default(&self.path).await?;
        let bytes = serde_json::to_vec_pretty(snapshot).expect("Snapshot always serializes");
        atomic_write(&self.path, &bytes).await?;
        info!(snapshot_seq = snapshot.snapshot_seq, "wrote projection snapshot");
        Ok(())
    }

    /// Load the snapshot, if one exists, validating it is not ahead of
    /// `log_last_seq` (spec §7 fatal condition).
    pub async fn load(&self, log_last_seq: u64) -> Result<Option<Snapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StorageError::Io { path: self.path.clone(), source: e })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Io {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;

        if snapshot.snapshot_seq > log_last_seq {
            return Err(SnapshotError::AheadOfLog {
                snapshot_seq: snapshot.snapshot_seq,
                log_last_seq,
            });
        }

        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_a_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let snapshot = Snapshot { snapshot_seq: 5, state: ProjectionState::default() };
        store.save(&snapshot).await.unwrap();

        let loaded = store.load(10).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot_seq, 5);
    }

    #[tokio::test]
    async fn rejects_snapshot_ahead_of_log() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save(&Snapshot { snapshot_seq: 10, state: ProjectionState::default() }).await.unwrap();

        let err = store.load(3).await.unwrap_err();
        assert!(matches!(err, SnapshotError::AheadOfLog { .. }));
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load(0).await.unwrap().is_none());
    }
}
