use std::collections::HashMap;

use flyback_selection::select;
use flyback_types::registry::{Campaign, Caps, Creative, Publisher, Registry, ScoringMode};
use flyback_types::{Budget, CapState, ProjectionState};
use proptest::prelude::*;

fn single_candidate_registry() -> Registry {
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
    let mut campaigns = HashMap::new();
    campaigns.insert(
        "camp1".to_string(),
        Campaign {
            campaign_id: "camp1".into(),
            publisher_id: "pub1".into(),
            advertiser_id: "adv1".into(),
            creative_ids: vec!["cr1".into()],
            outcome_weights: HashMap::new(),
            caps: Caps { max_outcomes: 10, max_weighted_value: 1000.0 },
            budget_total: 1000.0,
            publisher_rev_share_bps: None,
        },
    );
    let mut creatives = HashMap::new();
    creatives.insert(
        "cr1".to_string(),
        Creative { creative_id: "cr1".into(), sizes: vec!["300x250".into()], demand_type: "display".into(), creative_url: "https://example.test/cr1".into() },
    );
    Registry { publishers, campaigns, creatives }
}

proptest! {
    /// Spec §4.G step 7: when a raw `(campaign, creative)` pairing exists
    /// for the requested `(publisher, size)`, `select()` must never
    /// return "no candidate" — it falls back past the allow-list and past
    /// budget/cap exhaustion rather than leaving a fillable slot empty.
    /// Holds for any combination of remaining budget and cap usage.
    #[test]
    fn always_fills_when_a_raw_candidate_exists(
        remaining in -10.0f64..110.0,
        billable_count in 0u64..15,
        billable_weighted_value in 0.0f64..1200.0,
    ) {
        let reg = single_candidate_registry();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining });
        view.caps.insert("camp1".to_string(), CapState { billable_count, billable_weighted_value });

        let (_candidates, chosen) = select(&view, &reg, "pub1", "300x250");
        let chosen = chosen.expect("a raw candidate exists for this publisher/size");
        prop_assert_eq!(chosen.creative_id, "cr1");
        prop_assert_eq!(chosen.campaign_id, "camp1");
    }

    /// Selection is a pure function of its inputs: calling it twice
    /// against an unchanged view produces an identical decision.
    #[test]
    fn selection_is_deterministic(remaining in 0.0f64..100.0) {
        let reg = single_candidate_registry();
        let mut view = ProjectionState::default();
        view.budgets.insert("camp1".to_string(), Budget { total: 100.0, remaining });

        let (first_candidates, first_chosen) = select(&view, &reg, "pub1", "300x250");
        let (second_candidates, second_chosen) = select(&view, &reg, "pub1", "300x250");
        prop_assert_eq!(first_chosen.map(|c| c.creative_id), second_chosen.map(|c| c.creative_id));
        prop_assert_eq!(first_candidates.len(), second_candidates.len());
    }
}
