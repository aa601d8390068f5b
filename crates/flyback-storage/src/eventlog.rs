//! The append-only event log: sequence assignment, dedupe, crash-safe
//! append, and startup recovery (spec §4.C).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flyback_schema::schemas::EVENT_ENVELOPE;
use flyback_types::event::{Event, EventPayload, UnassignedEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::primitives::{append_ndjson, atomic_write, FileLock, StorageError};

/// Sidecar recording the log's frontier. Persisted as pretty JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventState {
    /// Highest `seq` durably present in the log.
    pub last_seq: u64,
}

/// Result of a successful `appendBatch` call.
#[derive(Debug, Clone, Default)]
pub struct AppendOutcome {
    /// The events as durably appended, with `seq`/`ts` assigned. Empty
    /// when the batch was a dedupe no-op.
    pub events: Vec<Event>,
    /// True when the whole batch was dropped because one of its
    /// `event_id`s was already known (spec §4.C step 4 — a successful
    /// no-op from the caller's point of view).
    pub deduped: bool,
    /// True when `last_seq` just crossed the configured snapshot
    /// interval; the caller (which owns the projection state a snapshot
    /// captures) should write one now.
    pub snapshot_due: bool,
}

struct Paths {
    events: PathBuf,
    state: PathBuf,
    index: PathBuf,
}

impl Paths {
    fn new(dir: &Path) -> Self {
        Self {
            events: dir.join("events.ndjson"),
            state: dir.join("event_state.json"),
            index: dir.join("event_index.json"),
        }
    }
}

struct Frontier {
    last_seq: u64,
    known_ids: HashSet<String>,
}

/// The append-only event log.
///
/// `last_seq`/the dedupe index are held behind an internal `RwLock` so
/// concurrent readers (tail scans from the delivery pump) don't block on
/// each other; `appendBatch` is additionally serialized by a non-reentrant
/// append mutex, matching spec §5's ownership rules.
pub struct EventLog {
    paths: Paths,
    snapshot_interval: u64,
    append_mutex: Mutex<()>,
    frontier: Arc<RwLock<Frontier>>,
}

impl EventLog {
    /// Open (creating if absent) the event log rooted at `dir`, replaying
    /// it into memory per spec §4.C's load algorithm.
    pub async fn open(dir: &Path, snapshot_interval: u64) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::Io { path: dir.to_path_buf(), source: e })?;
        let paths = Paths::new(dir);
        let (last_seq, known_ids) = Self::load(&paths).await?;

        Ok(Self {
            paths,
            snapshot_interval,
            append_mutex: Mutex::new(()),
            frontier: Arc::new(RwLock::new(Frontier { last_seq, known_ids })),
        })
    }

    /// Replay the log: sort by `seq`, drop lines whose `event_id` repeats
    /// an earlier one, tolerate a truncated final line, and reconcile
    /// `event_state.last_seq` / `event_index` against the file's true
    /// maximum `seq`.
    async fn load(paths: &Paths) -> Result<(u64, HashSet<String>), StorageError> {
        let mut events: Vec<Event> = Vec::new();

        if paths.events.exists() {
            let contents = tokio::fs::read_to_string(&paths.events)
                .await
                .map_err(|e| StorageError::Io { path: paths.events.clone(), source: e })?;
            let lines: Vec<&str> = contents.lines().collect();

            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let is_last = i == lines.len() - 1;
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => match serde_json::to_value(&event) {
                        Ok(value) => match EVENT_ENVELOPE.validate(&value) {
                            Ok(()) => events.push(event),
                            Err(violations) => {
                                let message = violations.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; ");
                                if is_last {
                                    warn!("dropping schema-invalid final log line during recovery: {message}");
                                } else {
                                    return Err(StorageError::Corrupt { path: paths.events.clone(), line: i, message });
                                }
                            }
                        },
                        Err(e) => {
                            return Err(StorageError::Corrupt { path: paths.events.clone(), line: i, message: e.to_string() });
                        }
                    },
                    Err(e) => {
                        if is_last {
                            warn!("dropping unparsable final log line during recovery: {e}");
                        } else {
                            return Err(StorageError::Corrupt { path: paths.events.clone(), line: i, message: e.to_string() });
                        }
                    }
                }
            }
        }

        events.sort_by_key(|e| e.seq);

        let mut known_ids = HashSet::new();
        let mut deduped_events = Vec::with_capacity(events.len());
        for event in events {
            if known_ids.contains(&event.event_id) {
                continue;
            }
            known_ids.insert(event.event_id.clone());
            deduped_events.push(event);
        }

        let max_seq_in_file = deduped_events.last().map(|e| e.seq).unwrap_or(0);

        let persisted_state: EventState = if paths.state.exists() {
            let bytes = tokio::fs::read(&paths.state)
                .await
                .map_err(|e| StorageError::Io { path: paths.state.clone(), source: e })?;
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            EventState::default()
        };

        let last_seq = if persisted_state.last_seq != max_seq_in_file {
            warn!(
                "reconciling event_state.last_seq ({}) with log maximum ({})",
                persisted_state.last_seq, max_seq_in_file
            );
            max_seq_in_file
        } else {
            persisted_state.last_seq
        };

        let index_ids: Option<HashSet<String>> = if paths.index.exists() {
            tokio::fs::read(&paths.index)
                .await
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
        } else {
            None
        };

        let known_ids = match index_ids {
            Some(ids) if ids == known_ids => ids,
            Some(_) => {
                warn!("event_index diverged from the log on load, rebuilding from the log");
                known_ids
            }
            None => {
                info!("no event_index found, rebuilding by scanning the log");
                known_ids
            }
        };

        Ok((last_seq, known_ids))
    }

    /// Append `entries` atomically: all durable with consecutive `seq`
    /// values, or none (spec §4.C's 9-step contract).
    pub async fn append_batch(
        &self,
        entries: Vec<UnassignedEvent>,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StorageError> {
        if entries.is_empty() {
            return Ok(AppendOutcome::default());
        }

        let _append_guard = self.append_mutex.lock().await;
        let _events_lock = FileLock::acquire_default(&self.paths.events).await?;
        let _state_lock = FileLock::acquire_default(&self.paths.state).await?;

        let (base_seq, already_known) = {
            let frontier = self.frontier.read().await;
            let known = entries
                .iter()
                .any(|e| e.event_id.as_ref().is_some_and(|id| frontier.known_ids.contains(id)));
            (frontier.last_seq, known)
        };

        if already_known {
            info!("dedupe hit on appendBatch, dropping whole batch as a no-op");
            return Ok(AppendOutcome { deduped: true, ..Default::default() });
        }

        let assigned: Vec<Event> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Event {
                seq: base_seq + i as u64 + 1,
                event_id: entry.event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                ts: now,
                payload: entry.payload,
            })
            .collect();

        for event in &assigned {
            let value = serde_json::to_value(event).map_err(|e| {
                StorageError::Io { path: self.paths.events.clone(), source: std::io::Error::new(std::io::ErrorKind::InvalidData, e) }
            })?;
            if let Err(violations) = EVENT_ENVELOPE.validate(&value) {
                let msg = violations.into_iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; ");
                return Err(StorageError::Io {
                    path: self.paths.events.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, msg),
                });
            }
        }

        let lines: Vec<String> = assigned
            .iter()
            .map(|e| serde_json::to_string(e).expect("Event always serializes"))
            .collect();

        append_ndjson(&self.paths.events, &lines).await?;

        let new_last_seq = assigned.last().map(|e| e.seq).unwrap_or(base_seq);
        atomic_write(
            &self.paths.state,
            serde_json::to_vec_pretty(&EventState { last_seq: new_last_seq })
                .expect("EventState always serializes")
                .as_slice(),
        )
        .await?;

        let crossed_interval = {
            let mut frontier = self.frontier.write().await;
            for event in &assigned {
                frontier.known_ids.insert(event.event_id.clone());
            }
            frontier.last_seq = new_last_seq;

            let mut sorted: Vec<&String> = frontier.known_ids.iter().collect();
            sorted.sort();
            atomic_write(
                &self.paths.index,
                serde_json::to_vec_pretty(&sorted).expect("index always serializes").as_slice(),
            )
            .await?;

            self.snapshot_interval > 0
                && (base_seq / self.snapshot_interval) != (new_last_seq / self.snapshot_interval)
        };

        Ok(AppendOutcome { events: assigned, deduped: false, snapshot_due: crossed_interval })
    }

    /// Current `last_seq`, for callers that need the log frontier without
    /// appending.
    pub async fn last_seq(&self) -> u64 {
        self.frontier.read().await.last_seq
    }

    /// Scan the log for the next event with `seq > after_seq` and, if
    /// provided, matching `type_filter`. Used by the delivery pump (spec
    /// §4.I step 3).
    pub async fn next_after(
        &self,
        after_seq: u64,
        type_filter: Option<&str>,
    ) -> Result<Option<Event>, StorageError> {
        if !self.paths.events.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.paths.events)
            .await
            .map_err(|e| StorageError::Io { path: self.paths.events.clone(), source: e })?;

        let mut candidates: Vec<Event> = contents
            .lines()
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .filter(|e| e.seq > after_seq)
            .filter(|e| type_filter.map_or(true, |t| e.type_name() == t))
            .collect();
        candidates.sort_by_key(|e| e.seq);
        Ok(candidates.into_iter().next())
    }

    /// Read every event with `seq` in `(after_seq, ..]`, in order. Used by
    /// the projection engine's tail-replay path.
    pub async fn tail_after(&self, after_seq: u64) -> Result<Vec<Event>, StorageError> {
        if !self.paths.events.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.paths.events)
            .await
            .map_err(|e| StorageError::Io { path: self.paths.events.clone(), source: e })?;
        let mut tail: Vec<Event> = contents
            .lines()
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .filter(|e| e.seq > after_seq)
            .collect();
        tail.sort_by_key(|e| e.seq);
        Ok(tail)
    }
}
