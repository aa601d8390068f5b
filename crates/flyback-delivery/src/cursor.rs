//! Persistence for the delivery pump's cursor (spec §3 "Delivery cursor").

use std::path::{Path, PathBuf};

use flyback_storage::{atomic_write, FileLock, StorageError};
use flyback_types::DeliveryCursor;

/// Loads and atomically persists `DeliveryCursor` at `dir/delivery_cursor.json`.
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// Open the cursor store rooted at `dir`.
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join("delivery_cursor.json") }
    }

    /// Load the persisted cursor, or the zero value if none exists yet.
    pub async fn load(&self) -> Result<DeliveryCursor, StorageError> {
        if !self.path.exists() {
            return Ok(DeliveryCursor::default());
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StorageError::Io { path: self.path.clone(), source: e })?;
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }

    /// Persist `cursor` atomically under the cursor lock.
    pub async fn save(&self, cursor: &DeliveryCursor) -> Result<(), StorageError> {
        let _lock = FileLock::acquire_default(&self.path).await?;
        atomic_write(&self.path, &serde_json::to_vec_pretty(cursor).expect("DeliveryCursor always serializes")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_a_cursor() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path());
        assert_eq!(store.load().await.unwrap().last_delivered_seq, 0);

        let cursor = DeliveryCursor { last_delivered_seq: 7, last_attempt_at: None, retry_count: 2 };
        store.save(&cursor).await.unwrap();
        assert_eq!(store.load().await.unwrap().last_delivered_seq, 7);
    }
}
