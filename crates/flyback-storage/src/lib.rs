#![forbid(unsafe_code)]

//! **flyback-storage** – Storage primitives, the append-only event log,
//! and snapshot/index persistence (spec §4.A, §4.C, §4.D).

pub mod eventlog;
pub mod primitives;
pub mod snapshot;

pub use eventlog::{AppendOutcome, EventLog, EventState};
pub use primitives::{append_ndjson, atomic_write, FileLock, StorageError};
pub use snapshot::{Snapshot, SnapshotError, SnapshotStore};
