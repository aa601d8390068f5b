use chrono::Utc;
use flyback_projection::reduce;
use flyback_types::event::{Event, EventPayload, BudgetDecrement};
use flyback_types::{Budget, ProjectionState};
use proptest::prelude::*;

const CAMPAIGN: &str = "camp1";
const TOTAL: f64 = 100.0;

proptest! {
    /// Spec §3's invariant — `remaining` is decremented exactly once per
    /// billable final and must never go negative — holds for any sequence
    /// of `budget.decrement` amounts, valid or not: an amount that would
    /// drive `remaining` negative is rejected and leaves the budget
    /// untouched, so `remaining` never drifts below zero no matter how
    /// the batch is shaped.
    #[test]
    fn remaining_never_goes_negative(amounts in prop::collection::vec(0.0f64..40.0, 0..12)) {
        let mut state = ProjectionState::default();
        state.budgets.insert(CAMPAIGN.to_string(), Budget { total: TOTAL, remaining: TOTAL });

        let mut seq = 0u64;
        let mut accepted_sum = 0.0;
        for amount in amounts {
            seq += 1;
            let event = Event {
                seq,
                event_id: format!("E{seq}"),
                ts: Utc::now(),
                payload: EventPayload::BudgetDecrement(BudgetDecrement { campaign_id: CAMPAIGN.to_string(), amount }),
            };
            match reduce(&mut state, &event) {
                Ok(()) => accepted_sum += amount,
                Err(_) => {
                    // Rejected: `remaining` must be exactly what it was before this call.
                    prop_assert_eq!(state.budgets[CAMPAIGN].remaining, TOTAL - accepted_sum);
                }
            }
            prop_assert!(state.budgets[CAMPAIGN].remaining >= 0.0);
        }
        prop_assert!((state.budgets[CAMPAIGN].remaining - (TOTAL - accepted_sum)).abs() < 1e-9);
    }

    /// `applied_seq` tracks the highest `seq` folded into state; folding
    /// events in increasing `seq` order must leave it monotonically
    /// non-decreasing regardless of how many (or few) events are folded.
    #[test]
    fn applied_seq_is_monotone(count in 0u64..20) {
        let mut state = ProjectionState::default();
        state.budgets.insert(CAMPAIGN.to_string(), Budget { total: TOTAL, remaining: TOTAL });

        let mut last = 0u64;
        for seq in 1..=count {
            let event = Event {
                seq,
                event_id: format!("E{seq}"),
                ts: Utc::now(),
                payload: EventPayload::BudgetDecrement(BudgetDecrement { campaign_id: CAMPAIGN.to_string(), amount: 0.0 }),
            };
            reduce(&mut state, &event).unwrap();
            prop_assert!(state.applied_seq >= last);
            last = state.applied_seq;
        }
        prop_assert_eq!(state.applied_seq, count);
    }
}
