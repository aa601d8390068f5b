//! The three ingestion commands — `fill`, `intent`, `postback` — each a
//! validate-then-append-then-project sequence (spec §4.J).

use chrono::{DateTime, Utc};
use flyback_projection::{EngineError, SubmitOutcome};
use flyback_selection::ChosenCreative;
use flyback_types::event::{
    BudgetDecrement, EventPayload, IntentCreated, LedgerAppendPayload, ResolutionFinal, ResolutionPartial, Scope,
    TokenExpired, UnassignedEvent, WindowReset,
};
use flyback_types::ledger::{payout_cents, LedgerEntry};
use flyback_types::token::{Token, TokenStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Fallback creative size when the caller doesn't specify one.
const DEFAULT_SIZE: &str = "300x250";

/// Stages that finalize a token (spec §4.J "isFinal").
const FINAL_STAGES: [&str; 3] = ["resolved", "purchase", "final"];

/// Errors surfaced by the command surface, mapped to wire responses in
/// `routes.rs`.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A `400 invalid_*` validation failure; no state was mutated.
    #[error("{0}")]
    Invalid(String),
    /// The process is a read-only replica (spec §4.J, final paragraph).
    #[error("write_disabled")]
    WriteDisabled,
    /// `404`: no token with that id.
    #[error("token not found")]
    TokenNotFound,
    /// `410`: `now` is past `expires_at` and the token never resolved;
    /// this call is the one that made the transition durable.
    #[error("expired")]
    Expired,
    /// `410`: the token had already transitioned to `EXPIRED` on a
    /// previous call; idempotent repeat, no new event.
    #[error("already_expired")]
    AlreadyExpired,
    /// Propagated from the projection engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Reply body for `POST /v1/fill`.
#[derive(Debug, Serialize)]
pub struct FillReply {
    pub creative_url: String,
    pub config: FillConfig,
}

#[derive(Debug, Serialize)]
pub struct FillConfig {
    pub campaign: String,
    pub publisher: String,
    pub creative: String,
    pub size: String,
}

/// Reply body for `POST /v1/intent`.
#[derive(Debug, Serialize)]
pub struct IntentReply {
    pub token: Token,
}

/// Reply body for `GET /v1/postback`.
#[derive(Debug, Serialize)]
pub struct PostbackReply {
    pub token: Token,
    pub status: PostbackStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostbackStatus {
    Resolved,
    Partial,
    AlreadyResolved,
}

/// If the live window has gone stale, close it with its own `window.reset`
/// submit before the caller's command runs (spec §5, "implicit
/// window-reset path triggered by command handlers").
async fn ensure_fresh_window(state: &AppState, now: DateTime<Utc>) -> Result<(), CommandError> {
    if !state.engine.window_is_stale(now).await {
        return Ok(());
    }
    let outcome = state
        .engine
        .submit(now, |view| {
            let closed = view.window.as_ref().map(|w| w.started_at).unwrap_or(now);
            Ok(vec![UnassignedEvent::new(EventPayload::WindowReset(WindowReset {
                closed_window_id: closed,
                new_window_id: now,
            }))])
        })
        .await?;
    if matches!(outcome, SubmitOutcome::Applied(_)) {
        info!("closed stale aggregation window");
    }
    Ok(())
}

/// `fill(publisher_id, size?)` (spec §4.J).
pub async fn fill(state: &AppState, publisher_id: &str, size: Option<String>) -> Result<FillReply, CommandError> {
    if !state.config.writes_enabled() {
        return Err(CommandError::WriteDisabled);
    }
    let now = Utc::now();
    ensure_fresh_window(state, now).await?;

    let registry = &state.registry;
    if !registry.publishers.contains_key(publisher_id) {
        return Err(CommandError::Invalid("invalid_publisher".into()));
    }
    let size = size.unwrap_or_else(|| DEFAULT_SIZE.to_string());

    let view = state.engine.read_view().await;
    let chosen: Option<ChosenCreative> = state.selection.choose(&view, registry, publisher_id, &size, now).await;

    let Some(chosen) = chosen else {
        warn!(publisher_id, "no eligible candidate for fill");
        return Err(CommandError::Invalid("no_eligible_candidate".into()));
    };

    let scope = Scope {
        campaign_id: chosen.campaign_id.clone(),
        publisher_id: publisher_id.to_string(),
        creative_id: chosen.creative_id.clone(),
    };
    state
        .engine
        .submit(now, move |_view| {
            Ok(vec![UnassignedEvent::new(EventPayload::ImpressionRecorded(
                flyback_types::event::ImpressionRecorded { scope: scope.clone() },
            ))])
        })
        .await?;

    Ok(FillReply {
        creative_url: chosen.creative_url,
        config: FillConfig {
            campaign: chosen.campaign_id,
            publisher: publisher_id.to_string(),
            creative: chosen.creative_id,
            size,
        },
    })
}

/// `intent(campaign, publisher, creative, intent_type, ...)` (spec §4.J).
#[allow(clippy::too_many_arguments)]
pub async fn intent(
    state: &AppState,
    campaign_id: &str,
    publisher_id: &str,
    creative_id: &str,
    intent_type: &str,
    dwell_seconds: Option<f64>,
    interaction_count: Option<u32>,
    parent_intent_id: Option<String>,
) -> Result<IntentReply, CommandError> {
    if !state.config.writes_enabled() {
        return Err(CommandError::WriteDisabled);
    }
    let now = Utc::now();
    ensure_fresh_window(state, now).await?;

    let registry = &state.registry;
    let campaign = registry
        .campaigns
        .get(campaign_id)
        .ok_or_else(|| CommandError::Invalid("campaign_unknown".into()))?;
    if campaign.publisher_id != publisher_id {
        return Err(CommandError::Invalid("publisher_mismatch".into()));
    }
    if !campaign.creative_ids.iter().any(|c| c == creative_id) {
        return Err(CommandError::Invalid("creative_mismatch".into()));
    }
    if !registry.creatives.contains_key(creative_id) {
        return Err(CommandError::Invalid("creative_unknown".into()));
    }

    let token_id = Uuid::new_v4().to_string();
    let scope = Scope {
        campaign_id: campaign_id.to_string(),
        publisher_id: publisher_id.to_string(),
        creative_id: creative_id.to_string(),
    };
    let advertiser_id = campaign.advertiser_id.clone();
    let payload = IntentCreated {
        token_id: token_id.clone(),
        scope,
        advertiser_id,
        intent_type: intent_type.to_string(),
        dwell_seconds,
        interaction_count,
        parent_intent_id,
    };

    state
        .engine
        .submit(now, move |_view| Ok(vec![UnassignedEvent::new(EventPayload::IntentCreated(payload.clone()))]))
        .await?;

    let view = state.engine.read_view().await;
    let token = view
        .tokens
        .get(&token_id)
        .cloned()
        .expect("just-applied intent.created always mints its token");
    Ok(IntentReply { token })
}

/// `postback(token_id, value?, stage?, outcome_type?)` (spec §4.J).
pub async fn postback(
    state: &AppState,
    token_id: &str,
    value: Option<f64>,
    stage: Option<String>,
    outcome_type: Option<String>,
) -> Result<PostbackReply, CommandError> {
    if !state.config.writes_enabled() {
        return Err(CommandError::WriteDisabled);
    }
    let now = Utc::now();
    ensure_fresh_window(state, now).await?;

    let stage = stage.unwrap_or_else(|| "resolved".to_string());
    let value = value.unwrap_or(0.0);
    let is_final = FINAL_STAGES.contains(&stage.as_str());

    let view = state.engine.read_view().await;
    let existing = view.tokens.get(token_id).cloned().ok_or(CommandError::TokenNotFound)?;

    if existing.status == TokenStatus::Expired {
        return Err(CommandError::AlreadyExpired);
    }
    if existing.is_expirable(now) {
        let token_id_owned = token_id.to_string();
        let scope = existing.scope.clone();
        state
            .engine
            .submit(now, move |_view| {
                Ok(vec![UnassignedEvent::new(EventPayload::TokenExpired(TokenExpired {
                    token_id: token_id_owned.clone(),
                    scope: scope.clone(),
                }))])
            })
            .await?;
        return Err(CommandError::Expired);
    }
    if existing.has_acknowledged(&stage) {
        return Ok(PostbackReply { token: existing, status: PostbackStatus::AlreadyResolved });
    }
    if existing.is_resolved() {
        warn!(token_id, stage, "postback.out_of_order: stage after final resolution");
    }

    let registry = &state.registry;
    let campaign = registry
        .campaigns
        .get(&existing.scope.campaign_id)
        .ok_or_else(|| CommandError::Invalid("campaign_unknown".into()))?;

    if is_final {
        let outcome_type = outcome_type.unwrap_or_else(|| stage.clone());
        let weighted_value = value * campaign.outcome_weight(&outcome_type);

        let rev_share_bps = campaign.publisher_rev_share_bps.unwrap_or_else(|| {
            registry.publishers.get(&existing.scope.publisher_id).map(|p| p.rev_share_bps).unwrap_or(0)
        });
        let advertiser_id = campaign.advertiser_id.clone();
        let max_outcomes = campaign.caps.max_outcomes;
        let max_weighted_value = campaign.caps.max_weighted_value;

        let scope = existing.scope.clone();
        let token_id_owned = token_id.to_string();
        let stage_owned = stage.clone();
        let outcome_type_owned = outcome_type.clone();

        // Cap/budget decision happens inside the build closure, against the
        // state snapshot frozen under the command mutex, not the `view`
        // read above — this is what gives caps first-writer-wins semantics
        // under concurrent postbacks for the same campaign.
        state
            .engine
            .submit(now, move |view| {
                let cap = view.caps.get(&scope.campaign_id).copied().unwrap_or_default();
                let projected_count = cap.billable_count + 1;
                let projected_weighted = cap.billable_weighted_value + weighted_value;
                let billable = projected_count <= max_outcomes && projected_weighted <= max_weighted_value;

                let mut events = vec![UnassignedEvent::new(EventPayload::ResolutionFinal(ResolutionFinal {
                    token_id: token_id_owned.clone(),
                    scope: scope.clone(),
                    stage: stage_owned.clone(),
                    value,
                    outcome_type: outcome_type_owned.clone(),
                    weighted_value,
                    billable,
                }))];

                if billable {
                    let budget = view
                        .budgets
                        .get(&scope.campaign_id)
                        .ok_or_else(|| EngineError::Rejected("budget_unknown".into()))?;
                    if budget.remaining < value {
                        return Err(EngineError::Rejected("budget_exhausted".into()));
                    }
                    events.push(UnassignedEvent::new(EventPayload::BudgetDecrement(BudgetDecrement {
                        campaign_id: scope.campaign_id.clone(),
                        amount: value,
                    })));

                    let window_id = view.window.as_ref().map(|w| w.started_at).unwrap_or(now);
                    let entry = LedgerEntry {
                        entry_id: Uuid::new_v4().to_string(),
                        created_at: now,
                        token_id: token_id_owned.clone(),
                        campaign_id: scope.campaign_id.clone(),
                        advertiser_id: advertiser_id.clone(),
                        publisher_id: scope.publisher_id.clone(),
                        creative_id: scope.creative_id.clone(),
                        window_id,
                        outcome_type: outcome_type_owned.clone(),
                        raw_value: value,
                        weighted_value,
                        billable: true,
                        payout_cents: payout_cents(value, rev_share_bps),
                        rev_share_bps,
                        final_stage: stage_owned.clone(),
                    };
                    events.push(UnassignedEvent::new(EventPayload::LedgerAppend(LedgerAppendPayload { entry })));
                }
                Ok(events)
            })
            .await?;
    } else {
        let scope = existing.scope.clone();
        let token_id_owned = token_id.to_string();
        let stage_owned = stage.clone();
        let outcome_type_owned = outcome_type.clone();
        state
            .engine
            .submit(now, move |_view| {
                Ok(vec![UnassignedEvent::new(EventPayload::ResolutionPartial(ResolutionPartial {
                    token_id: token_id_owned,
                    scope,
                    stage: stage_owned,
                    value,
                    outcome_type: outcome_type_owned,
                }))])
            })
            .await?;
    }

    let view = state.engine.read_view().await;
    let token = view.tokens.get(token_id).cloned().expect("token must still exist after postback");
    let status = if is_final { PostbackStatus::Resolved } else { PostbackStatus::Partial };
    Ok(PostbackReply { token, status })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    use flyback_delivery::{DeliveryConfig, DeliveryPump};
    use flyback_projection::Engine;
    use flyback_selection::SelectionEngine;
    use flyback_storage::EventLog;
    use flyback_types::registry::{Campaign, Caps, Creative, Publisher, ScoringMode};
    use flyback_types::Registry;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{Config, Role};

    /// Registry and `AppState` for spec §8 scenario S1/S3/S4/S5: one
    /// campaign, one publisher, one creative, rev-share 7000bps.
    async fn demo_state(max_outcomes: u64, budget_total: f64) -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();

        let mut publishers = Map::new();
        publishers.insert(
            "publisher-demo".to_string(),
            Publisher {
                publisher_id: "publisher-demo".into(),
                selection_mode: ScoringMode::Raw,
                floor_type: ScoringMode::Raw,
                floor_value_per_1k: 0.0,
                allowed_demand_types: vec!["display".into()],
                demand_priority: vec!["display".into()],
                rev_share_bps: 7000,
            },
        );

        let mut outcome_weights = Map::new();
        outcome_weights.insert("purchase".to_string(), 10.0);
        let mut campaigns = Map::new();
        campaigns.insert(
            "campaign-v1".to_string(),
            Campaign {
                campaign_id: "campaign-v1".into(),
                publisher_id: "publisher-demo".into(),
                advertiser_id: "advertiser-demo".into(),
                creative_ids: vec!["creative-v1".into()],
                outcome_weights,
                caps: Caps { max_outcomes, max_weighted_value: 200.0 },
                budget_total,
                publisher_rev_share_bps: None,
            },
        );

        let mut creatives = Map::new();
        creatives.insert(
            "creative-v1".to_string(),
            Creative {
                creative_id: "creative-v1".into(),
                sizes: vec![DEFAULT_SIZE.to_string()],
                demand_type: "display".into(),
                creative_url: "https://ads.example/creative-v1".into(),
            },
        );

        let registry = Arc::new(Registry { publishers, campaigns, creatives });

        let event_log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        let engine = Arc::new(Engine::open(dir.path(), event_log.clone(), 0, &registry).await.unwrap());
        let selection = Arc::new(SelectionEngine::new());
        let delivery = Arc::new(
            DeliveryPump::open(
                dir.path(),
                event_log.clone(),
                DeliveryConfig {
                    webhook_url: None,
                    webhook_secret: None,
                    timeout: std::time::Duration::from_secs(5),
                    backoff_base: std::time::Duration::from_secs(1),
                    backoff_max: std::time::Duration::from_secs(60),
                    max_retries: 5,
                    writes_enabled: true,
                },
            )
            .await
            .unwrap(),
        );

        let config = Arc::new(Config {
            data_dir: dir.path().to_string_lossy().to_string(),
            registry_path: String::new(),
            role: Role::Writer,
            port: 0,
            log_level: "info".into(),
            webhook_url: None,
            webhook_secret: None,
            webhook_timeout_secs: 5,
            webhook_backoff_base_secs: 1,
            webhook_backoff_max_secs: 60,
            webhook_max_retries: 5,
            rate_limit_window_secs: 1,
            rate_limit_max: 1000,
            rate_limit_bypass: Vec::new(),
            lock_timeout_secs: 5,
            lock_retry_ms: 50,
            ops_token_secret: None,
            ops_token_ttl_secs: 3600,
            snapshot_interval: 1000,
        });

        let state = AppState { config, registry, engine, selection, delivery, rate_limiter: rate_limiter() };
        (dir, state)
    }

    fn rate_limiter() -> Arc<crate::middleware::RateLimiter> {
        Arc::new(crate::middleware::RateLimiter::new(std::time::Duration::from_secs(1), 1000, Vec::new()))
    }

    /// S1: Intent + final purchase.
    #[tokio::test]
    async fn s1_intent_then_final_purchase_pays_out_and_decrements_budget() {
        let (_dir, state) = demo_state(10, 120.0).await;

        let intent = intent(&state, "campaign-v1", "publisher-demo", "creative-v1", "qualified", None, None, None)
            .await
            .unwrap();
        let token_id = intent.token.token_id.clone();

        let reply = postback(&state, &token_id, Some(5.0), Some("purchase".into()), Some("purchase".into()))
            .await
            .unwrap();

        assert_eq!(reply.status, PostbackStatus::Resolved);
        assert!(reply.token.billable);

        let view = state.engine.read_view().await;
        let budget = view.budgets.get("campaign-v1").unwrap();
        assert_eq!(budget.remaining, 115.0);
        assert_eq!(view.ledger.len(), 1);
        assert_eq!(view.ledger[0].payout_cents, 350);
    }

    /// S3: out-of-order postback stages.
    #[tokio::test]
    async fn s3_out_of_order_stages_resolve_once_and_record_history() {
        let (_dir, state) = demo_state(10, 120.0).await;
        let intent = intent(&state, "campaign-v1", "publisher-demo", "creative-v1", "qualified", None, None, None)
            .await
            .unwrap();
        let token_id = intent.token.token_id.clone();

        postback(&state, &token_id, Some(2.0), Some("lead".into()), None).await.unwrap();
        postback(&state, &token_id, Some(10.0), Some("purchase".into()), Some("purchase".into())).await.unwrap();
        postback(&state, &token_id, Some(2.0), Some("lead".into()), None).await.unwrap();
        let fourth = postback(&state, &token_id, Some(10.0), Some("purchase".into()), Some("purchase".into()))
            .await
            .unwrap();

        assert_eq!(fourth.status, PostbackStatus::AlreadyResolved);
        assert_eq!(fourth.token.resolution_events.len(), 3);
        assert_eq!(fourth.token.resolution_events[0].stage, "lead");
        assert_eq!(fourth.token.resolution_events[1].stage, "purchase");
        assert_eq!(fourth.token.resolution_events[2].stage, "lead");

        let view = state.engine.read_view().await;
        assert_eq!(view.budgets.get("campaign-v1").unwrap().remaining, 110.0);
        assert_eq!(view.ledger.len(), 1);
    }

    /// S4: a token whose `expires_at` is already past rejects postback
    /// with no budget/ledger side effect. Expiry is derived from
    /// `created_at` rather than stored, so the token is minted directly
    /// with a 31-day-old `intent.created` timestamp instead of going
    /// through the `intent` command (which always stamps `Utc::now()`).
    #[tokio::test]
    async fn s4_expired_token_rejects_without_side_effects() {
        let (_dir, state) = demo_state(10, 120.0).await;
        let token_id = Uuid::new_v4().to_string();
        let scope = Scope {
            campaign_id: "campaign-v1".into(),
            publisher_id: "publisher-demo".into(),
            creative_id: "creative-v1".into(),
        };
        let stale_ts = Utc::now() - chrono::Duration::days(31);
        state
            .engine
            .submit(stale_ts, {
                let token_id = token_id.clone();
                let scope = scope.clone();
                move |_view| {
                    Ok(vec![UnassignedEvent::new(EventPayload::IntentCreated(IntentCreated {
                        token_id: token_id.clone(),
                        scope: scope.clone(),
                        advertiser_id: "advertiser-demo".into(),
                        intent_type: "qualified".into(),
                        dwell_seconds: None,
                        interaction_count: None,
                        parent_intent_id: None,
                    }))])
                }
            })
            .await
            .unwrap();

        let err = postback(&state, &token_id, Some(5.0), Some("purchase".into()), None).await.unwrap_err();
        assert!(matches!(err, CommandError::Expired));

        let view = state.engine.read_view().await;
        assert!(view.budgets.get("campaign-v1").map(|b| b.remaining) == Some(120.0));
        assert!(view.ledger.is_empty());

        let repeat_err = postback(&state, &token_id, Some(5.0), Some("purchase".into()), None).await.unwrap_err();
        assert!(matches!(repeat_err, CommandError::AlreadyExpired));

        let view = state.engine.read_view().await;
        assert!(view.budgets.get("campaign-v1").map(|b| b.remaining) == Some(120.0));
        assert!(view.ledger.is_empty());
    }

    /// S5: cap enforcement at `max_outcomes = 1`.
    #[tokio::test]
    async fn s5_second_final_over_cap_is_non_billable() {
        let (_dir, state) = demo_state(1, 1000.0).await;

        let first = intent(&state, "campaign-v1", "publisher-demo", "creative-v1", "qualified", None, None, None)
            .await
            .unwrap();
        let second = intent(&state, "campaign-v1", "publisher-demo", "creative-v1", "qualified", None, None, None)
            .await
            .unwrap();

        let first_reply =
            postback(&state, &first.token.token_id, Some(5.0), Some("purchase".into()), Some("purchase".into()))
                .await
                .unwrap();
        let second_reply =
            postback(&state, &second.token.token_id, Some(5.0), Some("purchase".into()), Some("purchase".into()))
                .await
                .unwrap();

        assert!(first_reply.token.billable);
        assert!(!second_reply.token.billable);

        let view = state.engine.read_view().await;
        assert_eq!(view.ledger.len(), 1);
        let cap = view.caps.get("campaign-v1").copied().unwrap_or_default();
        assert_eq!(cap.billable_count, 1);
        let window = view.window.unwrap();
        let scope = second.token.scope.clone();
        assert_eq!(window.scopes[&scope].non_billable_resolutions, 1);
    }
}
