//! Static publisher/campaign/creative catalog (spec §4.F).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scoring mode a publisher's policy selects between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Score on raw derived value per 1k.
    Raw,
    /// Score on weighted derived value per 1k, falling back to raw when no
    /// weighted sum exists yet for the scope.
    Weighted,
}

/// A publisher's selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publisher {
    /// Publisher identifier.
    pub publisher_id: String,
    /// Whether candidates are scored raw or weighted.
    pub selection_mode: ScoringMode,
    /// Which metric the floor is measured against.
    pub floor_type: ScoringMode,
    /// Minimum `{floor_type}_value_per_1k` a candidate must clear.
    pub floor_value_per_1k: f64,
    /// Demand types this publisher accepts.
    pub allowed_demand_types: Vec<String>,
    /// Priority ordering of demand types, most preferred first.
    pub demand_priority: Vec<String>,
    /// Publisher revenue share in basis points.
    pub rev_share_bps: u32,
}

impl Publisher {
    /// Index of `demand_type` in `demand_priority`, or `demand_priority.len()`
    /// if absent (sorts unlisted types last, spec §4.G step 6).
    pub fn priority_index(&self, demand_type: &str) -> usize {
        self.demand_priority
            .iter()
            .position(|d| d == demand_type)
            .unwrap_or(self.demand_priority.len())
    }
}

/// Per-campaign caps on billable outcomes (spec §3 "Cap state").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Caps {
    /// Maximum billable outcome count.
    pub max_outcomes: u64,
    /// Maximum billable weighted value sum.
    pub max_weighted_value: f64,
}

/// A campaign: ownership, outcome weights, caps, and optional publisher
/// rev-share override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Owning publisher.
    pub publisher_id: String,
    /// Owning advertiser.
    pub advertiser_id: String,
    /// Creative ids this campaign may serve.
    pub creative_ids: Vec<String>,
    /// Weight applied per outcome type to derive `weighted_value`.
    pub outcome_weights: HashMap<String, f64>,
    /// Billable-outcome caps.
    pub caps: Caps,
    /// Total budget allocated to the campaign (spec §3 "Budget").
    pub budget_total: f64,
    /// Overrides the publisher's `rev_share_bps` when present.
    pub publisher_rev_share_bps: Option<u32>,
}

impl Campaign {
    /// Weight for `outcome_type`, defaulting to `1.0` when unlisted.
    pub fn outcome_weight(&self, outcome_type: &str) -> f64 {
        self.outcome_weights.get(outcome_type).copied().unwrap_or(1.0)
    }
}

/// A creative: sizes it supports, its demand type, and its serving URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creative {
    /// Creative identifier.
    pub creative_id: String,
    /// Supported sizes, e.g. `"300x250"`.
    pub sizes: Vec<String>,
    /// Demand-type classification used by publisher floors/allow-lists.
    pub demand_type: String,
    /// URL served to the page when this creative is chosen.
    pub creative_url: String,
}

/// The fully loaded, referentially-validated static catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    /// Publishers keyed by id.
    pub publishers: HashMap<String, Publisher>,
    /// Campaigns keyed by id.
    pub campaigns: HashMap<String, Campaign>,
    /// Creatives keyed by id.
    pub creatives: HashMap<String, Creative>,
}

impl Registry {
    /// Campaigns owned by `publisher_id`.
    pub fn campaigns_for_publisher<'a>(
        &'a self,
        publisher_id: &'a str,
    ) -> impl Iterator<Item = &'a Campaign> + 'a {
        self.campaigns
            .values()
            .filter(move |c| c.publisher_id == publisher_id)
    }
}
