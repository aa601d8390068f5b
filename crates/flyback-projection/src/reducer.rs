//! The deterministic reducer: `(state, event) -> state` (spec §4.E, §9
//! "Reducer as pure function over tagged events").

use chrono::Duration as ChronoDuration;
use flyback_types::event::{Event, EventPayload};
use flyback_types::token::{ResolutionHistoryEntry, Token, TokenStatus};
use flyback_types::{AggregateWindow, ProjectionState};
use thiserror::Error;

/// Width of one aggregation window (spec §3 "Aggregate window").
pub const WINDOW_DURATION: ChronoDuration = ChronoDuration::minutes(10);

/// Errors raised by the reducer. Every variant is a fatal integrity
/// violation (spec §4.E step 5) — the caller rolls back and exits.
#[derive(Debug, Error, PartialEq)]
pub enum ReducerError {
    /// `intent.created` named a `token_id` that already exists.
    #[error("intent.created for already-existing token {0}")]
    DuplicateToken(String),
    /// A resolution referenced a token that was never created.
    #[error("resolution referenced unknown token {0}")]
    UnknownToken(String),
    /// `budget.decrement` would drive `remaining` negative.
    #[error("budget.decrement would drive campaign {campaign_id} remaining negative: {remaining} - {amount}")]
    NegativeBudget { campaign_id: String, remaining: f64, amount: f64 },
    /// `budget.decrement` named a campaign with no budget record.
    #[error("budget.decrement for unknown campaign {0}")]
    UnknownCampaignBudget(String),
}

fn ensure_window(state: &mut ProjectionState, ts: chrono::DateTime<chrono::Utc>) -> &mut AggregateWindow {
    if state.window.is_none() {
        state.window = Some(AggregateWindow::new(ts));
    }
    state.window.as_mut().expect("just ensured")
}

/// Fold one event into `state`. Pure aside from logging: given the same
/// `(state, event)` pair it always produces the same resulting state
/// (spec §8 invariant 4, "Projection determinism").
pub fn reduce(state: &mut ProjectionState, event: &Event) -> Result<(), ReducerError> {
    match &event.payload {
        EventPayload::ImpressionRecorded(p) => {
            let window = ensure_window(state, event.ts);
            window.scope_mut(&p.scope).impressions += 1;
        }
        EventPayload::IntentCreated(p) => {
            if state.tokens.contains_key(&p.token_id) {
                return Err(ReducerError::DuplicateToken(p.token_id.clone()));
            }
            let token = Token::new(p.token_id.clone(), p.scope.clone(), p.advertiser_id.clone(), event.ts);
            state.tokens.insert(p.token_id.clone(), token);

            let window = ensure_window(state, event.ts);
            window.scope_mut(&p.scope).intents += 1;
        }
        EventPayload::ResolutionPartial(p) => {
            let token = state
                .tokens
                .get_mut(&p.token_id)
                .ok_or_else(|| ReducerError::UnknownToken(p.token_id.clone()))?;
            token.resolution_events.push(ResolutionHistoryEntry {
                stage: p.stage.clone(),
                resolved_at: event.ts,
                resolved_value: p.value,
                outcome_type: p.outcome_type.clone(),
                is_final: false,
            });
            if !token.has_acknowledged(&p.stage) {
                token.acknowledged_stages.push(p.stage.clone());
            }

            let window = ensure_window(state, event.ts);
            window.scope_mut(&p.scope).partial_resolutions += 1;
        }
        EventPayload::ResolutionFinal(p) => {
            let token = state
                .tokens
                .get_mut(&p.token_id)
                .ok_or_else(|| ReducerError::UnknownToken(p.token_id.clone()))?;
            let was_resolved = token.is_resolved();
            token.resolution_events.push(ResolutionHistoryEntry {
                stage: p.stage.clone(),
                resolved_at: event.ts,
                resolved_value: p.value,
                outcome_type: Some(p.outcome_type.clone()),
                is_final: true,
            });
            if !token.has_acknowledged(&p.stage) {
                token.acknowledged_stages.push(p.stage.clone());
            }

            if !was_resolved {
                token.status = TokenStatus::Resolved;
                token.resolved_at = Some(event.ts);
                token.resolved_value = Some(p.value);
                token.outcome_type = Some(p.outcome_type.clone());
                token.billable = p.billable;

                let window = ensure_window(state, event.ts);
                let counters = window.scope_mut(&p.scope);
                counters.resolved_intents += 1;
                counters.resolved_value_sum += p.value;
                counters.weighted_resolved_value_sum += p.weighted_value;
                if p.billable {
                    counters.billable_resolutions += 1;
                } else {
                    counters.non_billable_resolutions += 1;
                }

                let cap = state.caps.entry(p.scope.campaign_id.clone()).or_default();
                if p.billable {
                    cap.billable_count += 1;
                    cap.billable_weighted_value += p.weighted_value;
                }
            }
        }
        EventPayload::BudgetDecrement(p) => {
            let budget = state
                .budgets
                .get_mut(&p.campaign_id)
                .ok_or_else(|| ReducerError::UnknownCampaignBudget(p.campaign_id.clone()))?;
            let new_remaining = budget.remaining - p.amount;
            if new_remaining < 0.0 {
                return Err(ReducerError::NegativeBudget {
                    campaign_id: p.campaign_id.clone(),
                    remaining: budget.remaining,
                    amount: p.amount,
                });
            }
            budget.remaining = new_remaining;
        }
        EventPayload::LedgerAppend(p) => {
            if state
                .find_ledger_entry(&p.entry.token_id, &p.entry.final_stage)
                .is_none()
            {
                state.ledger.push(p.entry.clone());
            }
        }
        EventPayload::TokenExpired(p) => {
            let token = state
                .tokens
                .get_mut(&p.token_id)
                .ok_or_else(|| ReducerError::UnknownToken(p.token_id.clone()))?;
            if !token.is_resolved() {
                token.status = TokenStatus::Expired;
            }
        }
        EventPayload::WindowReset(_) => {
            if let Some(current) = state.window.take() {
                state.last_window = Some(current);
            }
            state.window = Some(AggregateWindow::new(event.ts));
        }
    }

    state.applied_seq = event.seq;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flyback_types::event::{ImpressionRecorded, IntentCreated, Scope};

    fn scope() -> Scope {
        Scope { campaign_id: "c".into(), publisher_id: "p".into(), creative_id: "cr".into() }
    }

    fn event(seq: u64, payload: EventPayload) -> Event {
        Event { seq, event_id: format!("E{seq}"), ts: Utc::now(), payload }
    }

    #[test]
    fn impression_bumps_lazily_created_window() {
        let mut state = ProjectionState::default();
        assert!(state.window.is_none());
        reduce(&mut state, &event(1, EventPayload::ImpressionRecorded(ImpressionRecorded { scope: scope() }))).unwrap();
        assert_eq!(state.window.as_ref().unwrap().scopes[&scope()].impressions, 1);
    }

    #[test]
    fn resolution_for_unknown_token_is_fatal() {
        let mut state = ProjectionState::default();
        let err = reduce(
            &mut state,
            &event(1, EventPayload::ResolutionPartial(flyback_types::event::ResolutionPartial {
                token_id: "missing".into(),
                scope: scope(),
                stage: "lead".into(),
                value: 1.0,
                outcome_type: None,
            })),
        )
        .unwrap_err();
        assert_eq!(err, ReducerError::UnknownToken("missing".into()));
    }

    #[test]
    fn token_expired_transitions_status_once() {
        let mut state = ProjectionState::default();
        reduce(&mut state, &event(1, EventPayload::IntentCreated(IntentCreated {
            token_id: "t1".into(), scope: scope(), advertiser_id: "adv".into(),
            intent_type: "qualified".into(), dwell_seconds: None, interaction_count: None, parent_intent_id: None,
        }))).unwrap();

        reduce(&mut state, &event(2, EventPayload::TokenExpired(flyback_types::event::TokenExpired {
            token_id: "t1".into(), scope: scope(),
        }))).unwrap();

        assert_eq!(state.tokens["t1"].status, TokenStatus::Expired);
    }

    #[test]
    fn second_final_does_not_double_count_or_overwrite_status() {
        let mut state = ProjectionState::default();
        reduce(&mut state, &event(1, EventPayload::IntentCreated(IntentCreated {
            token_id: "t1".into(), scope: scope(), advertiser_id: "adv".into(),
            intent_type: "qualified".into(), dwell_seconds: None, interaction_count: None, parent_intent_id: None,
        }))).unwrap();

        let final_payload = |stage: &str| EventPayload::ResolutionFinal(flyback_types::event::ResolutionFinal {
            token_id: "t1".into(), scope: scope(), stage: stage.into(), value: 5.0,
            outcome_type: "purchase".into(), weighted_value: 50.0, billable: true,
        });
        reduce(&mut state, &event(2, final_payload("purchase"))).unwrap();
        reduce(&mut state, &event(3, final_payload("refund"))).unwrap();

        let token = &state.tokens["t1"];
        assert_eq!(token.resolved_value, Some(5.0)); // unchanged by the second final
        assert_eq!(token.resolution_events.len(), 2); // both recorded in history
        let window = state.window.as_ref().unwrap();
        assert_eq!(window.scopes[&scope()].resolved_intents, 1); // only counted once
    }
}
