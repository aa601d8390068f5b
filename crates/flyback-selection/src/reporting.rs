//! Publisher-scoped reporting views: a pure function over a read-only
//! projection snapshot (spec §4.H).

use chrono::{DateTime, Utc};
use flyback_types::event::Scope;
use flyback_types::registry::Registry;
use flyback_types::{DeliveryCursor, LedgerEntry, ProjectionState};

use crate::selection::SelectionDecision;

/// Per-`(campaign, publisher, creative)` observed activity for the live
/// window.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AggregateRow {
    /// Scope this row describes.
    pub scope: Scope,
    /// `impression.recorded` count.
    pub impressions: u64,
    /// `intent.created` count.
    pub intents: u64,
    /// Count of tokens resolved in this window.
    pub resolved_intents: u64,
    /// `intents / impressions`, `0.0` when no impressions.
    pub intent_rate: f64,
    /// `resolved_intents / intents`, `0.0` when no intents.
    pub resolution_rate: f64,
    /// `resolved_value_sum / impressions * 1000`.
    pub derived_value_per_1k: f64,
}

/// A publisher's static floor + scoring policy, echoed back for operators.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PublisherPolicy {
    /// Raw or weighted.
    pub selection_mode: flyback_types::registry::ScoringMode,
    /// Which metric the floor is measured against.
    pub floor_type: flyback_types::registry::ScoringMode,
    /// Minimum metric value a candidate must clear.
    pub floor_value_per_1k: f64,
    /// Demand types this publisher accepts.
    pub allowed_demand_types: Vec<String>,
    /// Revenue share in basis points.
    pub rev_share_bps: u32,
}

/// Rollup of the most recently closed window, aggregated across every
/// scope owned by the publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LastWindowObserved {
    /// Window identity (its `started_at`), if a window has ever closed.
    pub window_id: Option<DateTime<Utc>>,
    /// Sum of impressions across every scope.
    pub impressions: u64,
    /// `resolved_value_sum / impressions * 1000`, aggregated.
    pub raw_value_per_1k: f64,
    /// `weighted_resolved_value_sum / impressions * 1000`, aggregated.
    pub weighted_value_per_1k: f64,
    /// Billable final resolutions observed.
    pub billable_resolutions: u64,
    /// Non-billable (over-cap) final resolutions observed.
    pub non_billable_resolutions: u64,
}

/// Cap usage vs. limit for one campaign.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CapReport {
    /// Campaign the caps belong to.
    pub campaign_id: String,
    /// Billable finals observed so far.
    pub billable_count: u64,
    /// Configured maximum.
    pub max_outcomes: u64,
    /// Billable weighted value observed so far.
    pub billable_weighted_value: f64,
    /// Configured maximum.
    pub max_weighted_value: f64,
}

/// Window and lifetime payout totals for a publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LedgerStats {
    /// Payout cents for entries in the live window.
    pub window_payout_cents: i64,
    /// Entry count for the live window.
    pub window_entry_count: u64,
    /// Payout cents across every entry ever recorded.
    pub lifetime_payout_cents: i64,
    /// Entry count across every entry ever recorded.
    pub lifetime_entry_count: u64,
}

/// Delivery pump health, supplied by the caller (owned by the delivery
/// crate, not by this one — spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeliveryHealth {
    /// Persisted delivery cursor.
    pub cursor: DeliveryCursor,
    /// Count of entries currently in the dead-letter queue.
    pub dlq_depth: u64,
}

/// The full publisher-scoped report (spec §4.H).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PublisherReport {
    /// Publisher this report is for.
    pub publisher_id: String,
    /// Per-scope rows for the live window.
    pub aggregate_rows: Vec<AggregateRow>,
    /// The publisher's static policy.
    pub policy: PublisherPolicy,
    /// Rollup of the last closed window.
    pub last_window: LastWindowObserved,
    /// Cap usage for every campaign owned by this publisher.
    pub caps: Vec<CapReport>,
    /// Window and lifetime ledger totals.
    pub ledger_stats: LedgerStats,
    /// Top-N billable ledger entries by payout, descending.
    pub top_ledger_entries: Vec<LedgerEntry>,
    /// The last N selection decisions for this publisher.
    pub last_selection_decisions: Vec<SelectionDecision>,
    /// Delivery pump health, if supplied.
    pub delivery_health: Option<DeliveryHealth>,
}

/// Build a [`PublisherReport`] from a read-only snapshot. Pure: never
/// mutates `view`.
#[allow(clippy::too_many_arguments)]
pub fn build_report(
    view: &ProjectionState,
    registry: &Registry,
    publisher_id: &str,
    top_ledger_n: usize,
    selection_decisions: Vec<SelectionDecision>,
    delivery_health: Option<DeliveryHealth>,
) -> Option<PublisherReport> {
    let publisher = registry.publishers.get(publisher_id)?;

    let aggregate_rows: Vec<AggregateRow> = view
        .window
        .as_ref()
        .map(|w| {
            w.scopes
                .iter()
                .filter(|(scope, _)| scope.publisher_id == publisher_id)
                .map(|(scope, c)| AggregateRow {
                    scope: scope.clone(),
                    impressions: c.impressions,
                    intents: c.intents,
                    resolved_intents: c.resolved_intents,
                    intent_rate: if c.impressions == 0 { 0.0 } else { c.intents as f64 / c.impressions as f64 },
                    resolution_rate: if c.intents == 0 { 0.0 } else { c.resolved_intents as f64 / c.intents as f64 },
                    derived_value_per_1k: c.derived_value_per_1k(),
                })
                .collect()
        })
        .unwrap_or_default();

    let last_window = view
        .last_window
        .as_ref()
        .map(|w| {
            let scoped: Vec<_> = w.scopes.iter().filter(|(s, _)| s.publisher_id == publisher_id).collect();
            let impressions: u64 = scoped.iter().map(|(_, c)| c.impressions).sum();
            let resolved_value_sum: f64 = scoped.iter().map(|(_, c)| c.resolved_value_sum).sum();
            let weighted_resolved_value_sum: f64 = scoped.iter().map(|(_, c)| c.weighted_resolved_value_sum).sum();
            LastWindowObserved {
                window_id: Some(w.started_at),
                impressions,
                raw_value_per_1k: if impressions == 0 { 0.0 } else { resolved_value_sum / impressions as f64 * 1000.0 },
                weighted_value_per_1k: if impressions == 0 { 0.0 } else { weighted_resolved_value_sum / impressions as f64 * 1000.0 },
                billable_resolutions: scoped.iter().map(|(_, c)| c.billable_resolutions).sum(),
                non_billable_resolutions: scoped.iter().map(|(_, c)| c.non_billable_resolutions).sum(),
            }
        })
        .unwrap_or_default();

    let caps: Vec<CapReport> = registry
        .campaigns_for_publisher(publisher_id)
        .map(|campaign| {
            let usage = view.caps.get(&campaign.campaign_id).copied().unwrap_or_default();
            CapReport {
                campaign_id: campaign.campaign_id.clone(),
                billable_count: usage.billable_count,
                max_outcomes: campaign.caps.max_outcomes,
                billable_weighted_value: usage.billable_weighted_value,
                max_weighted_value: campaign.caps.max_weighted_value,
            }
        })
        .collect();

    let publisher_ledger: Vec<&LedgerEntry> = view.ledger.iter().filter(|e| e.publisher_id == publisher_id).collect();
    let window_id = view.window.as_ref().map(|w| w.started_at);
    let ledger_stats = LedgerStats {
        window_payout_cents: publisher_ledger.iter().filter(|e| Some(e.window_id) == window_id).map(|e| e.payout_cents).sum(),
        window_entry_count: publisher_ledger.iter().filter(|e| Some(e.window_id) == window_id).count() as u64,
        lifetime_payout_cents: publisher_ledger.iter().map(|e| e.payout_cents).sum(),
        lifetime_entry_count: publisher_ledger.len() as u64,
    };

    let mut top_ledger_entries: Vec<LedgerEntry> = publisher_ledger.iter().filter(|e| e.billable).map(|e| (*e).clone()).collect();
    top_ledger_entries.sort_by(|a, b| b.payout_cents.cmp(&a.payout_cents));
    top_ledger_entries.truncate(top_ledger_n);

    Some(PublisherReport {
        publisher_id: publisher_id.to_string(),
        aggregate_rows,
        policy: PublisherPolicy {
            selection_mode: publisher.selection_mode,
            floor_type: publisher.floor_type,
            floor_value_per_1k: publisher.floor_value_per_1k,
            allowed_demand_types: publisher.allowed_demand_types.clone(),
            rev_share_bps: publisher.rev_share_bps,
        },
        last_window,
        caps,
        ledger_stats,
        top_ledger_entries,
        last_selection_decisions: selection_decisions,
        delivery_health,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyback_types::registry::{Publisher, ScoringMode};
    use std::collections::HashMap;

    fn registry() -> Registry {
        let mut publishers = HashMap::new();
        publishers.insert(
            "pub1".to_string(),
            Publisher {
                publisher_id: "pub1".into(),
                selection_mode: ScoringMode::Raw,
                floor_type: ScoringMode::Raw,
                floor_value_per_1k: 0.0,
                allowed_demand_types: vec!["display".into()],
                demand_priority: vec!["display".into()],
                rev_share_bps: 7000,
            },
        );
        Registry { publishers, campaigns: HashMap::new(), creatives: HashMap::new() }
    }

    #[test]
    fn unknown_publisher_yields_none() {
        let view = ProjectionState::default();
        let reg = registry();
        assert!(build_report(&view, &reg, "missing", 5, Vec::new(), None).is_none());
    }

    #[test]
    fn report_carries_policy_through() {
        let view = ProjectionState::default();
        let reg = registry();
        let report = build_report(&view, &reg, "pub1", 5, Vec::new(), None).unwrap();
        assert_eq!(report.policy.rev_share_bps, 7000);
        assert!(report.aggregate_rows.is_empty());
    }
}
