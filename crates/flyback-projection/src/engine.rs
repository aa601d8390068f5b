//! The projection engine: owns the live [`ProjectionState`], replays it
//! from snapshot + tail on open, and funnels every command through one
//! serialized decide → append → apply pipeline (spec §4.E).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flyback_storage::{atomic_write, EventLog, Snapshot, SnapshotError, SnapshotStore, StorageError};
use flyback_types::event::{Event, UnassignedEvent};
use flyback_types::{Budget, ProjectionState, Registry};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::reducer::{reduce, ReducerError};

/// Errors from submitting or applying a command batch.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying storage failure (append, snapshot, or hot-file write).
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Snapshot-load-time integrity failure at startup.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// A reducer or invariant failure; fatal per spec §4.E step 5 — the
    /// engine has already rolled back in-memory state.
    #[error("projection invariant violated, rolled back: {0}")]
    Reducer(#[from] ReducerError),
    /// The caller's command-builder rejected the request before any event
    /// was constructed (e.g. a referential or validation error).
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Outcome of [`Engine::submit`].
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The builder produced no events; nothing was appended.
    NoOp,
    /// The batch's `event_id`s were already known; no new state changed.
    Deduped,
    /// The batch was durably appended and folded into projection state.
    Applied(Vec<Event>),
}

struct ProjectionPaths {
    tokens: PathBuf,
    aggregates: PathBuf,
    budgets: PathBuf,
    cursor: PathBuf,
}

impl ProjectionPaths {
    fn new(dir: &Path) -> Self {
        Self {
            tokens: dir.join("tokens.json"),
            aggregates: dir.join("aggregates.json"),
            budgets: dir.join("budgets.json"),
            cursor: dir.join("cursor.json"),
        }
    }
}

/// Owns the durable projection: the live [`ProjectionState`], the event
/// log it is folded from, and the mutexes that serialize writers.
///
/// The `command_mutex` spans the whole decide → append → apply sequence
/// for a single command, not just the apply step — this is what gives
/// cap/budget decisions "first-writer-wins" semantics (spec §3, "Cap
/// state"): the builder closure passed to [`Engine::submit`] sees a
/// state snapshot that cannot be invalidated by a concurrent command
/// before its events are durably appended.
pub struct Engine {
    event_log: Arc<EventLog>,
    snapshot_store: SnapshotStore,
    paths: ProjectionPaths,
    snapshot_interval: u64,
    command_mutex: Mutex<()>,
    state: RwLock<ProjectionState>,
    applied_event_ids: RwLock<HashSet<String>>,
}

impl Engine {
    /// Open the engine rooted at `dir`, reconstructing state from the
    /// latest snapshot (if any) plus every event after `snapshot_seq`, then
    /// seeding a fresh `Budget` for any `registry` campaign state doesn't
    /// already track (spec §3 "Budget"; §8 S1 "seed registry with ...
    /// budget total 120"). Seeding never touches a campaign's existing
    /// budget, so a restart never resets `remaining`.
    pub async fn open(
        dir: &Path,
        event_log: Arc<EventLog>,
        snapshot_interval: u64,
        registry: &Registry,
    ) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::Io { path: dir.to_path_buf(), source: e })?;

        let snapshot_store = SnapshotStore::new(dir);
        let log_last_seq = event_log.last_seq().await;
        let snapshot = snapshot_store.load(log_last_seq).await?;

        let (mut state, from_seq) = match snapshot {
            Some(Snapshot { snapshot_seq, state }) => (state, snapshot_seq),
            None => (ProjectionState::default(), 0),
        };

        let tail = event_log.tail_after(from_seq).await?;
        let mut applied_event_ids: HashSet<String> = HashSet::new();
        for event in &tail {
            reduce(&mut state, event)?;
            applied_event_ids.insert(event.event_id.clone());
        }
        info!(from_seq, replayed = tail.len(), applied_seq = state.applied_seq, "projection engine opened");

        for campaign in registry.campaigns.values() {
            state.budgets.entry(campaign.campaign_id.clone()).or_insert(Budget {
                total: campaign.budget_total,
                remaining: campaign.budget_total,
            });
        }

        let engine = Self {
            event_log,
            snapshot_store,
            paths: ProjectionPaths::new(dir),
            snapshot_interval,
            command_mutex: Mutex::new(()),
            state: RwLock::new(state),
            applied_event_ids: RwLock::new(applied_event_ids),
        };
        engine.persist_hot_state().await?;
        Ok(engine)
    }

    /// A read-only, structurally-cloned snapshot of the live projection
    /// (spec §9, "read-only views via projection snapshots"). Callers can
    /// never observe or mutate the live containers.
    pub async fn read_view(&self) -> ProjectionState {
        self.state.read().await.clone()
    }

    /// Submit one command. `build` runs under the command mutex against a
    /// frozen read of current state, so the events it returns are decided
    /// against state that cannot be invalidated by a concurrent submit
    /// before this call's events are appended.
    pub async fn submit<F>(&self, now: DateTime<Utc>, build: F) -> Result<SubmitOutcome, EngineError>
    where
        F: FnOnce(&ProjectionState) -> Result<Vec<UnassignedEvent>, EngineError>,
    {
        let _guard = self.command_mutex.lock().await;

        let unassigned = {
            let state = self.state.read().await;
            build(&state)?
        };
        if unassigned.is_empty() {
            return Ok(SubmitOutcome::NoOp);
        }

        let outcome = self.event_log.append_batch(unassigned, now).await?;
        if outcome.deduped {
            return Ok(SubmitOutcome::Deduped);
        }

        self.apply_batch(&outcome.events, "command").await?;
        if outcome.snapshot_due {
            self.write_snapshot().await?;
        }
        Ok(SubmitOutcome::Applied(outcome.events))
    }

    /// Fold `events` into live state per spec §4.E steps 1-5. On any
    /// reducer error the in-memory state is rolled back to its pre-batch
    /// value and the error is returned — the caller (the command surface)
    /// must treat this as fatal and exit so an operator can repair.
    async fn apply_batch(&self, events: &[Event], reason: &str) -> Result<(), EngineError> {
        let mut sorted: Vec<&Event> = events.iter().collect();
        sorted.sort_by_key(|e| e.seq);

        let mut state_guard = self.state.write().await;
        let mut ids_guard = self.applied_event_ids.write().await;

        let rollback_state = state_guard.clone();
        let rollback_ids = ids_guard.clone();

        for event in sorted {
            if event.seq <= state_guard.applied_seq || ids_guard.contains(&event.event_id) {
                continue;
            }
            if let Err(e) = reduce(&mut state_guard, event) {
                error!(reason, seq = event.seq, error = %e, "projection rollback: reducer failure");
                *state_guard = rollback_state;
                *ids_guard = rollback_ids;
                return Err(EngineError::Reducer(e));
            }
            ids_guard.insert(event.event_id.clone());
        }
        drop(ids_guard);
        let state_copy = state_guard.clone();
        drop(state_guard);

        self.persist_hot_state_for(&state_copy).await?;
        Ok(())
    }

    async fn persist_hot_state(&self) -> Result<(), EngineError> {
        let state = self.state.read().await.clone();
        self.persist_hot_state_for(&state).await
    }

    /// Write tokens/aggregates/budgets/cursor as four independent atomic
    /// files (spec §4.E step 4) in addition to the periodic full snapshot.
    async fn persist_hot_state_for(&self, state: &ProjectionState) -> Result<(), EngineError> {
        atomic_write(&self.paths.tokens, &serde_json::to_vec_pretty(&state.tokens).expect("serializes")).await?;
        atomic_write(
            &self.paths.aggregates,
            &serde_json::to_vec_pretty(&(&state.window, &state.last_window)).expect("serializes"),
        )
        .await?;
        atomic_write(&self.paths.budgets, &serde_json::to_vec_pretty(&state.budgets).expect("serializes")).await?;
        atomic_write(
            &self.paths.cursor,
            &serde_json::to_vec_pretty(&state.applied_seq).expect("serializes"),
        )
        .await?;
        Ok(())
    }

    async fn write_snapshot(&self) -> Result<(), EngineError> {
        let state = self.state.read().await.clone();
        let snapshot = Snapshot { snapshot_seq: state.applied_seq, state };
        self.snapshot_store.save(&snapshot).await?;
        Ok(())
    }

    /// True if the live window is stale and a `window.reset` should be
    /// appended before the next read-view (spec §4.E "Window freshness").
    pub async fn window_is_stale(&self, now: DateTime<Utc>) -> bool {
        match &self.state.read().await.window {
            Some(w) => now - w.started_at >= crate::reducer::WINDOW_DURATION,
            None => false,
        }
    }

    /// Force a snapshot write regardless of the interval cursor — used at
    /// graceful shutdown so the next startup replays the shortest tail.
    pub async fn checkpoint(&self) -> Result<(), EngineError> {
        let _guard = self.command_mutex.lock().await;
        warn!("checkpointing projection snapshot on shutdown");
        self.write_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyback_types::event::{EventPayload, ImpressionRecorded, Scope};
    use tempfile::tempdir;

    fn scope() -> Scope {
        Scope { campaign_id: "c".into(), publisher_id: "p".into(), creative_id: "cr".into() }
    }

    #[tokio::test]
    async fn submit_applies_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        let engine = Engine::open(dir.path(), log.clone(), 0, &Registry::default()).await.unwrap();

        let outcome = engine
            .submit(Utc::now(), |_state| {
                Ok(vec![UnassignedEvent::new(EventPayload::ImpressionRecorded(ImpressionRecorded { scope: scope() }))])
            })
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Applied(_)));

        let view = engine.read_view().await;
        assert_eq!(view.window.unwrap().scopes[&scope()].impressions, 1);

        let reopened = Engine::open(dir.path(), log, 0, &Registry::default()).await.unwrap();
        let view = reopened.read_view().await;
        assert_eq!(view.window.unwrap().scopes[&scope()].impressions, 1);
    }

    #[tokio::test]
    async fn rejected_command_never_touches_the_log() {
        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        let engine = Engine::open(dir.path(), log.clone(), 0, &Registry::default()).await.unwrap();

        let err = engine
            .submit(Utc::now(), |_state| Err(EngineError::Rejected("budget exhausted".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(log.last_seq().await, 0);
    }
}
