//! Deterministic, side-effect-free creative selection (spec §4.G).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use flyback_types::event::Scope;
use flyback_types::projection_state::ScopeCounters;
use flyback_types::registry::{Registry, ScoringMode};
use flyback_types::ProjectionState;
use tokio::sync::Mutex;
use tracing::warn;

/// A candidate's remaining/cap usage is "near exhaustion" at this ratio
/// (spec §4.G step 6).
pub const NEAR_BUDGET_EXHAUSTION_RATIO: f64 = 0.20;
/// Cap usage counts as "near exhaustion" at this ratio of either metric.
pub const NEAR_CAP_EXHAUSTION_RATIO: f64 = 0.80;
/// Raw/weighted divergence at or above this fraction counts toward the
/// guardrail (spec §4.G step 9).
pub const DIVERGENCE_THRESHOLD: f64 = 0.30;
/// Consecutive divergent selections before the guardrail warns.
pub const DIVERGENCE_WINDOW_STREAK: u32 = 2;
/// Bound on the selection-history ring (spec §4.G step 8).
pub const SELECTION_HISTORY_CAPACITY: usize = 1000;

/// Which metric a candidate was ultimately scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUsed {
    /// `selection_mode = weighted` and a weighted sum existed for the scope.
    Weighted,
    /// `selection_mode = weighted` but no weighted sum existed yet.
    RawFallback,
    /// `selection_mode = raw`.
    Raw,
}

/// One scored candidate considered for a `(publisher, size)` request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredCandidate {
    /// Owning campaign.
    pub campaign_id: String,
    /// Creative under consideration.
    pub creative_id: String,
    /// Creative's demand-type classification.
    pub demand_type: String,
    /// Which metric produced `metric_value`.
    pub metric_used: MetricUsed,
    /// The value compared during sort/floor, per 1k impressions.
    pub metric_value: f64,
    /// True when the owning campaign's budget is within 20% of exhaustion.
    pub near_budget_exhaustion: bool,
    /// True when either cap metric is at/above 80% of its limit.
    pub near_cap_exhaustion: bool,
    /// Index into the publisher's `demand_priority`, used for sorting.
    pub priority_index: usize,
}

/// The creative actually chosen, if any candidate survived.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChosenCreative {
    /// Owning campaign.
    pub campaign_id: String,
    /// Chosen creative id.
    pub creative_id: String,
    /// URL to serve.
    pub creative_url: String,
    /// Metric the choice was made on.
    pub metric_used: MetricUsed,
    /// Value of that metric.
    pub metric_value: f64,
}

/// A recorded selection decision (spec §4.G step 8).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SelectionDecision {
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
    /// Publisher the request was for.
    pub publisher_id: String,
    /// Requested creative size.
    pub size: String,
    /// Every candidate considered, post budget/cap/allow-list filtering.
    pub candidates: Vec<ScoredCandidate>,
    /// The chosen creative, or `None` if nothing was eligible.
    pub chosen: Option<ChosenCreative>,
}

fn scope_counters<'a>(state: &'a ProjectionState, scope: &Scope) -> Option<&'a ScopeCounters> {
    state.window.as_ref().and_then(|w| w.scopes.get(scope))
}

fn compute_metric(
    registry_mode: ScoringMode,
    counters: Option<&ScopeCounters>,
) -> (MetricUsed, f64) {
    match registry_mode {
        ScoringMode::Weighted => match counters {
            Some(c) if c.weighted_resolved_value_sum != 0.0 => {
                (MetricUsed::Weighted, c.weighted_derived_value_per_1k())
            }
            Some(c) => (MetricUsed::RawFallback, c.derived_value_per_1k()),
            None => (MetricUsed::RawFallback, 0.0),
        },
        ScoringMode::Raw => (MetricUsed::Raw, counters.map(ScopeCounters::derived_value_per_1k).unwrap_or(0.0)),
    }
}

fn floor_metric_value(
    floor_type: ScoringMode,
    counters: Option<&ScopeCounters>,
) -> f64 {
    match floor_type {
        ScoringMode::Raw => counters.map(ScopeCounters::derived_value_per_1k).unwrap_or(0.0),
        ScoringMode::Weighted => counters.map(ScopeCounters::weighted_derived_value_per_1k).unwrap_or(0.0),
    }
}

struct Pre<'a> {
    campaign: &'a flyback_types::registry::Campaign,
    creative: &'a flyback_types::registry::Creative,
}

fn budget_and_cap_ok(c: &Pre, view: &ProjectionState) -> bool {
    let budget_ok = view.budgets.get(&c.campaign.campaign_id).is_some_and(|b| b.remaining > 0.0);
    let cap = view.caps.get(&c.campaign.campaign_id).copied().unwrap_or_default();
    let caps_ok =
        cap.billable_count < c.campaign.caps.max_outcomes && cap.billable_weighted_value < c.campaign.caps.max_weighted_value;
    budget_ok && caps_ok
}

fn score_candidate(c: &Pre, view: &ProjectionState, publisher: &flyback_types::registry::Publisher, publisher_id: &str) -> ScoredCandidate {
    let scope = Scope {
        campaign_id: c.campaign.campaign_id.clone(),
        publisher_id: publisher_id.to_string(),
        creative_id: c.creative.creative_id.clone(),
    };
    let counters = scope_counters(view, &scope);
    let (metric_used, metric_value) = compute_metric(publisher.selection_mode, counters);

    let budget = view.budgets.get(&c.campaign.campaign_id);
    let near_budget_exhaustion = budget.is_some_and(|b| b.remaining_ratio() <= NEAR_BUDGET_EXHAUSTION_RATIO);

    let cap = view.caps.get(&c.campaign.campaign_id).copied().unwrap_or_default();
    let count_ratio = if c.campaign.caps.max_outcomes == 0 {
        1.0
    } else {
        cap.billable_count as f64 / c.campaign.caps.max_outcomes as f64
    };
    let value_ratio = if c.campaign.caps.max_weighted_value <= 0.0 {
        1.0
    } else {
        cap.billable_weighted_value / c.campaign.caps.max_weighted_value
    };
    let exhausted = count_ratio >= 1.0 || value_ratio >= 1.0;
    let near_cap_exhaustion = !exhausted && count_ratio.max(value_ratio) >= NEAR_CAP_EXHAUSTION_RATIO;

    ScoredCandidate {
        campaign_id: c.campaign.campaign_id.clone(),
        creative_id: c.creative.creative_id.clone(),
        demand_type: c.creative.demand_type.clone(),
        metric_used,
        metric_value,
        near_budget_exhaustion,
        near_cap_exhaustion,
        priority_index: publisher.priority_index(&c.creative.demand_type),
    }
}

/// Sort by spec §4.G step 6's exact key order.
fn sort_candidates(candidates: &mut [&ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        a.priority_index
            .cmp(&b.priority_index)
            .then(a.near_budget_exhaustion.cmp(&b.near_budget_exhaustion))
            .then(a.near_cap_exhaustion.cmp(&b.near_cap_exhaustion))
            .then(b.metric_value.partial_cmp(&a.metric_value).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.campaign_id.cmp(&b.campaign_id))
            .then(a.creative_id.cmp(&b.creative_id))
    });
}

fn creative_url_for<'a>(pool: &[&'a Pre], creative_id: &str) -> String {
    pool.iter().find(|p| p.creative.creative_id == creative_id).map(|p| p.creative.creative_url.clone()).unwrap_or_default()
}

/// Build, filter, and score candidates; return the full candidate list and
/// the chosen creative (steps 1-7 of spec §4.G).
pub fn select(view: &ProjectionState, registry: &Registry, publisher_id: &str, size: &str) -> (Vec<ScoredCandidate>, Option<ChosenCreative>) {
    let Some(publisher) = registry.publishers.get(publisher_id) else {
        return (Vec::new(), None);
    };

    let raw_candidates: Vec<Pre> = registry
        .campaigns_for_publisher(publisher_id)
        .flat_map(|campaign| {
            campaign.creative_ids.iter().filter_map(|creative_id| {
                let creative = registry.creatives.get(creative_id)?;
                if !creative.sizes.iter().any(|s| s == size) || creative.demand_type.is_empty() {
                    return None;
                }
                Some(Pre { campaign, creative })
            })
        })
        .collect();

    let budget_and_cap_allowed: Vec<&Pre> = raw_candidates.iter().filter(|c| budget_and_cap_ok(c, view)).collect();

    let allow_listed: Vec<&Pre> = budget_and_cap_allowed
        .iter()
        .copied()
        .filter(|c| publisher.allowed_demand_types.iter().any(|d| d == &c.creative.demand_type))
        .collect();

    let scored: Vec<ScoredCandidate> = allow_listed.iter().map(|c| score_candidate(c, view, publisher, publisher_id)).collect();

    let floored: Vec<&ScoredCandidate> = scored
        .iter()
        .filter(|c| {
            let scope = Scope {
                campaign_id: c.campaign_id.clone(),
                publisher_id: publisher_id.to_string(),
                creative_id: c.creative_id.clone(),
            };
            floor_metric_value(publisher.floor_type, scope_counters(view, &scope)) >= publisher.floor_value_per_1k
        })
        .collect();

    let mut eligible: Vec<&ScoredCandidate> = if floored.is_empty() { scored.iter().collect() } else { floored };
    sort_candidates(&mut eligible);

    // Step 7: if the eligible set (post allow-list, post floor) is empty,
    // progressively relax filters — first the allow-list (try any
    // budget-and-cap-allowed candidate), then budget/cap itself (try the
    // first raw candidate) — under the same sort ordering each time.
    if !eligible.is_empty() {
        let chosen = eligible.first().map(|c| ChosenCreative {
            campaign_id: c.campaign_id.clone(),
            creative_id: c.creative_id.clone(),
            creative_url: creative_url_for(&allow_listed, &c.creative_id),
            metric_used: c.metric_used,
            metric_value: c.metric_value,
        });
        return (scored, chosen);
    }

    if !budget_and_cap_allowed.is_empty() {
        let fallback_scored: Vec<ScoredCandidate> =
            budget_and_cap_allowed.iter().map(|c| score_candidate(c, view, publisher, publisher_id)).collect();
        let mut sorted: Vec<&ScoredCandidate> = fallback_scored.iter().collect();
        sort_candidates(&mut sorted);
        let chosen = sorted.first().map(|c| ChosenCreative {
            campaign_id: c.campaign_id.clone(),
            creative_id: c.creative_id.clone(),
            creative_url: creative_url_for(&budget_and_cap_allowed, &c.creative_id),
            metric_used: c.metric_used,
            metric_value: c.metric_value,
        });
        return (fallback_scored, chosen);
    }

    if !raw_candidates.is_empty() {
        let pool: Vec<&Pre> = raw_candidates.iter().collect();
        let fallback_scored: Vec<ScoredCandidate> = pool.iter().map(|c| score_candidate(c, view, publisher, publisher_id)).collect();
        let mut sorted: Vec<&ScoredCandidate> = fallback_scored.iter().collect();
        sort_candidates(&mut sorted);
        let chosen = sorted.first().map(|c| ChosenCreative {
            campaign_id: c.campaign_id.clone(),
            creative_id: c.creative_id.clone(),
            creative_url: creative_url_for(&pool, &c.creative_id),
            metric_used: c.metric_used,
            metric_value: c.metric_value,
        });
        return (fallback_scored, chosen);
    }

    (Vec::new(), None)
}

/// Owns the bounded selection-history ring and the per-publisher
/// raw/weighted divergence streak (spec §4.G steps 8-9).
pub struct SelectionEngine {
    history: Mutex<VecDeque<SelectionDecision>>,
    divergence_streak: Mutex<HashMap<String, u32>>,
}

impl Default for SelectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionEngine {
    /// Construct an engine with an empty history and no divergence state.
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(SELECTION_HISTORY_CAPACITY)),
            divergence_streak: Mutex::new(HashMap::new()),
        }
    }

    /// Run selection for `(publisher_id, size)`, record the decision in the
    /// history ring, and evaluate the divergence guardrail.
    pub async fn choose(
        &self,
        view: &ProjectionState,
        registry: &Registry,
        publisher_id: &str,
        size: &str,
        now: DateTime<Utc>,
    ) -> Option<ChosenCreative> {
        let (candidates, chosen) = select(view, registry, publisher_id, size);

        self.evaluate_divergence(view, registry, publisher_id, size, &candidates, now).await;

        let decision = SelectionDecision {
            decided_at: now,
            publisher_id: publisher_id.to_string(),
            size: size.to_string(),
            candidates,
            chosen: chosen.clone(),
        };
        let mut history = self.history.lock().await;
        if history.len() >= SELECTION_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(decision);

        chosen
    }

    /// Compare the raw-top and weighted-top candidates and emit a warning
    /// once divergence has held for `DIVERGENCE_WINDOW_STREAK` consecutive
    /// selections for this publisher (spec §4.G step 9).
    async fn evaluate_divergence(
        &self,
        view: &ProjectionState,
        registry: &Registry,
        publisher_id: &str,
        size: &str,
        candidates: &[ScoredCandidate],
        now: DateTime<Utc>,
    ) {
        let Some(publisher) = registry.publishers.get(publisher_id) else { return };
        if publisher.selection_mode != ScoringMode::Weighted {
            return;
        }

        let raw_top = candidates
            .iter()
            .map(|c| {
                let scope = Scope { campaign_id: c.campaign_id.clone(), publisher_id: publisher_id.to_string(), creative_id: c.creative_id.clone() };
                scope_counters(view, &scope).map(ScopeCounters::derived_value_per_1k).unwrap_or(0.0)
            })
            .fold(f64::MIN, f64::max);
        let weighted_top = candidates.iter().map(|c| c.metric_value).fold(f64::MIN, f64::max);

        if !raw_top.is_finite() || !weighted_top.is_finite() {
            return;
        }

        let divergence = (weighted_top - raw_top).abs() / raw_top.abs().max(1.0);
        let mut streaks = self.divergence_streak.lock().await;
        let streak = streaks.entry(publisher_id.to_string()).or_insert(0);

        if divergence >= DIVERGENCE_THRESHOLD {
            *streak += 1;
            if *streak >= DIVERGENCE_WINDOW_STREAK {
                warn!(publisher_id, size, divergence, streak = *streak, decided_at = %now, "raw/weighted selection divergence guardrail triggered");
            }
        } else {
            *streak = 0;
        }
    }

    /// The last `n` recorded selection decisions, most recent last.
    pub async fn last_decisions(&self, n: usize) -> Vec<SelectionDecision> {
        let history = self.history.lock().await;
        history.iter().rev().take(n).rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyback_types::registry::{Campaign, Caps, Creative, Publisher};
    use flyback_types::{Budget, CapState};
    use std::collections::HashMap as Map;

    fn registry() -> Registry {
        let mut publishers = Map::new();
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
        let mut campaigns = Map::new();
        campaigns.insert(
            "camp1".to_string(),
            Campaign {
                campaign_id: "camp1".into(),
                publisher_id: "pub1".into(),
                advertiser_id: "adv1".into(),
                creative_ids: vec!["cr1".into()],
                outcome_weights: Map::new(),
                caps: Caps { max_outcomes: 10, max_weighted_value: 1000.0 },
                budget_total: 1000.0,
                publisher_rev_share_bps: None,
            },
        );
        let mut creatives = Map::new();
        creatives.insert(
            "cr1".to_string(),
            Creative { creative_id: "cr1".into(), sizes: vec!["300x250".into()], demand_type: "display".into(), creative_url: "https://example.test/cr1".into() },
        );
        Registry { publishers, campaigns, creatives }
    }

    /// A second, healthy campaign/creative on the same publisher, used to
    /// verify that an exhausted candidate is merely deprioritized rather
    /// than chosen by fallback when an alternative exists.
    fn registry_with_alternative() -> Registry {
        let mut reg = registry();
        reg.campaigns.insert(
            "camp2".to_string(),
            Campaign {
                campaign_id: "camp2".into(),
                publisher_id: "pub1".into(),
                advertiser_id: "adv1".into(),
                creative_ids: vec!["cr2".into()],
                outcome_weights: Map::new(),
                caps: Caps { max_outcomes: 10, max_weighted_value: 1000.0 },
                budget_total: 1000.0,
                publisher_rev_share_bps: None,
            },
        );
        reg.creatives.insert(
            "cr2".to_string(),
            Creative { creative_id: "cr2".into(), sizes: vec!["300x250".into()], demand_type: "display".into(), creative_url: "https://example.test/cr2".into() },
        );
        reg
    }

    #[test]
    fn prefers_an_available_candidate_over_an_exhausted_one() {
        let reg = registry_with_alternative();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining: 0.0 });
        view.budgets.insert("camp2".to_string(), Budget { total: 100.0, remaining: 100.0 });
        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        assert_eq!(chosen.unwrap().creative_id, "cr2");
    }

    #[test]
    fn falls_back_to_a_budget_exhausted_candidate_when_no_alternative_exists() {
        let reg = registry();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining: 0.0 });
        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        assert_eq!(chosen.unwrap().creative_id, "cr1");
    }

    #[test]
    fn falls_back_to_a_cap_exhausted_candidate_when_no_alternative_exists() {
        let reg = registry();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining: 100.0 });
        view.caps.insert("camp1".to_string(), CapState { billable_count: 10, billable_weighted_value: 0.0 });
        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        assert_eq!(chosen.unwrap().creative_id, "cr1");
    }

    #[test]
    fn falls_back_past_the_allow_list_when_no_alternative_exists() {
        let mut reg = registry();
        reg.publishers.get_mut("pub1").unwrap().allowed_demand_types = vec!["video".into()];
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining: 100.0 });
        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        assert_eq!(chosen.unwrap().creative_id, "cr1");
    }

    #[test]
    fn chooses_the_only_eligible_candidate() {
        let reg = registry();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining: 100.0 });
        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        let chosen = chosen.unwrap();
        assert_eq!(chosen.creative_id, "cr1");
        assert_eq!(chosen.creative_url, "https://example.test/cr1");
    }
}
