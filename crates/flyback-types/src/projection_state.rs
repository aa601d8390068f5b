//! Aggregate windows, budgets, caps, delivery cursor, and DLQ entries
//! (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Scope;
use crate::ledger::LedgerEntry;
use crate::token::Token;

/// Counters and sums for one `(campaign, publisher, creative)` bucket
/// within a single 10-minute aggregation window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeCounters {
    /// `impression.recorded` count.
    pub impressions: u64,
    /// `intent.created` count.
    pub intents: u64,
    /// Count of tokens that reached `Resolved` in this window.
    pub resolved_intents: u64,
    /// `resolution.partial` count.
    pub partial_resolutions: u64,
    /// Count of final resolutions that were billable.
    pub billable_resolutions: u64,
    /// Count of final resolutions that were not billable (over-cap).
    pub non_billable_resolutions: u64,
    /// Sum of raw resolved values.
    pub resolved_value_sum: f64,
    /// Sum of weighted resolved values.
    pub weighted_resolved_value_sum: f64,
}

impl ScopeCounters {
    /// `resolved_value_sum / impressions * 1000` (GLOSSARY "Derived value
    /// per 1k"). Zero impressions yields `0.0` rather than `NaN`.
    pub fn derived_value_per_1k(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.resolved_value_sum / self.impressions as f64 * 1000.0
        }
    }

    /// `weighted_resolved_value_sum / impressions * 1000`.
    pub fn weighted_derived_value_per_1k(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.weighted_resolved_value_sum / self.impressions as f64 * 1000.0
        }
    }
}

/// A 10-minute wall-clock aggregation window. Identity is its
/// `started_at` timestamp (GLOSSARY "Window").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateWindow {
    /// Start of this window; also its identity.
    pub started_at: DateTime<Utc>,
    /// Live per-scope counters for this window. `Scope` is a composite
    /// struct, not a string, so `serde_json`'s object-key serializer can't
    /// write it directly; wire-encoded as an entry list instead.
    #[serde(with = "scope_map")]
    pub scopes: HashMap<Scope, ScopeCounters>,
}

/// (De)serializes `HashMap<Scope, ScopeCounters>` as a `[(Scope,
/// ScopeCounters), ...]` entry list, since `serde_json` map keys must be
/// strings or primitives.
mod scope_map {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Scope, ScopeCounters};

    pub fn serialize<S>(map: &HashMap<Scope, ScopeCounters>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        map.iter().collect::<Vec<(&Scope, &ScopeCounters)>>().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<Scope, ScopeCounters>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Vec::<(Scope, ScopeCounters)>::deserialize(deserializer)?.into_iter().collect())
    }
}

impl AggregateWindow {
    /// Open a new, empty window starting at `started_at`.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            scopes: HashMap::new(),
        }
    }

    /// Mutable access to a scope's counters, creating them lazily on first
    /// bump (spec §3 "Window objects are created lazily at first bump").
    pub fn scope_mut(&mut self, scope: &Scope) -> &mut ScopeCounters {
        self.scopes.entry(scope.clone()).or_default()
    }
}

/// Per-campaign spend tracking. `remaining` is decremented exactly once per
/// billable final resolution and must never go negative (spec §3
/// invariant).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Total budget allocated to the campaign.
    pub total: f64,
    /// Remaining, undecremented budget.
    pub remaining: f64,
}

impl Budget {
    /// Ratio `remaining / total`, used by the selection engine's
    /// near-exhaustion heuristic. Returns `1.0` for a zero-total budget so
    /// it never spuriously reads as near-exhausted.
    pub fn remaining_ratio(&self) -> f64 {
        if self.total <= 0.0 {
            1.0
        } else {
            self.remaining / self.total
        }
    }
}

/// Derived cap usage for a single campaign: count and weighted-value sum
/// of billable finals observed so far (spec §3 "Cap state").
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapState {
    /// Count of billable final resolutions.
    pub billable_count: u64,
    /// Sum of weighted values of billable final resolutions.
    pub billable_weighted_value: f64,
}

/// The persisted delivery pump cursor (spec §3 "Delivery cursor").
/// `last_delivered_seq` is monotone — it never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliveryCursor {
    /// Highest `seq` durably delivered (or abandoned to the DLQ).
    pub last_delivered_seq: u64,
    /// Timestamp of the most recent delivery attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts against the current head event.
    pub retry_count: u32,
}

impl Default for DeliveryCursor {
    fn default() -> Self {
        Self {
            last_delivered_seq: 0,
            last_attempt_at: None,
            retry_count: 0,
        }
    }
}

/// A line written to the dead-letter journal once delivery of an event is
/// abandoned (spec §3 "DLQ entry").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// When the event was abandoned.
    pub failed_at: DateTime<Utc>,
    /// `seq` of the abandoned event.
    pub seq: u64,
    /// `event_id` of the abandoned event.
    pub event_id: String,
    /// Final HTTP status observed, if any.
    pub status: Option<u16>,
    /// Human-readable failure reason.
    pub error: String,
    /// The event payload that failed to deliver, for operator replay.
    pub payload: Value,
}

/// The full projection state exclusively owned by the projection engine
/// (spec §3 "Ownership") — tokens, the live aggregate window plus the
/// last completed one, budgets, ledger, and derived cap state. This is
/// exactly what a snapshot captures and what a read-view is a read-only
/// copy of.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Tokens keyed by `token_id`.
    pub tokens: HashMap<String, Token>,
    /// The live aggregation window.
    pub window: Option<AggregateWindow>,
    /// The most recently closed window, snapshotted by `window.reset`.
    pub last_window: Option<AggregateWindow>,
    /// Per-campaign budgets.
    pub budgets: HashMap<String, Budget>,
    /// Per-campaign derived cap usage.
    pub caps: HashMap<String, CapState>,
    /// Every ledger entry ever appended, in append order.
    pub ledger: Vec<LedgerEntry>,
    /// Highest `seq` folded into this state.
    pub applied_seq: u64,
}

impl ProjectionState {
    /// Find a ledger entry by `(token_id, final_stage)`, the uniqueness
    /// key from spec §3.
    pub fn find_ledger_entry(&self, token_id: &str, final_stage: &str) -> Option<&LedgerEntry> {
        self.ledger
            .iter()
            .find(|e| e.token_id == token_id && e.final_stage == final_stage)
    }
}
