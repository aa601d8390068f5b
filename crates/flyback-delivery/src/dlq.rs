//! The dead-letter journal for events abandoned by the delivery pump
//! (spec §4.I step 6, §3 "DLQ entry").

use std::path::{Path, PathBuf};

use flyback_schema::schemas::DLQ_ENTRY;
use flyback_storage::{append_ndjson, FileLock, StorageError};
use flyback_types::DlqEntry;
use tracing::warn;

/// Appends and counts dead-lettered deliveries, persisted as NDJSON
/// alongside the event log.
pub struct DlqStore {
    path: PathBuf,
}

impl DlqStore {
    /// Open the DLQ journal at `dir/dlq.ndjson`.
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join("dlq.ndjson") }
    }

    /// Append `entry`. Schema violations are logged, not fatal — spec §4.B
    /// only treats event-schema failures on load as fatal.
    pub async fn append(&self, entry: &DlqEntry) -> Result<(), StorageError> {
        let value = serde_json::to_value(entry).expect("DlqEntry always serializes");
        if let Err(violations) = DLQ_ENTRY.validate(&value) {
            warn!(?violations, "dlq entry failed schema validation, appending anyway");
        }
        let _lock = FileLock::acquire_default(&self.path).await?;
        let line = serde_json::to_string(entry).expect("DlqEntry always serializes");
        append_ndjson(&self.path, std::slice::from_ref(&line)).await
    }

    /// Current count of dead-lettered entries.
    pub async fn depth(&self) -> Result<u64, StorageError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StorageError::Io { path: self.path.clone(), source: e })?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_and_counts_entries() {
        let dir = tempdir().unwrap();
        let store = DlqStore::new(dir.path());
        assert_eq!(store.depth().await.unwrap(), 0);

        store
            .append(&DlqEntry {
                failed_at: Utc::now(),
                seq: 1,
                event_id: "E1".into(),
                status: Some(500),
                error: "timeout".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(store.depth().await.unwrap(), 1);
    }
}
