//! Append-only event envelope and payload union (spec §3, §4.C).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the `(campaign, publisher, creative)` triple an event or
/// aggregate bucket is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Campaign identifier.
    pub campaign_id: String,
    /// Publisher identifier.
    pub publisher_id: String,
    /// Creative identifier.
    pub creative_id: String,
}

/// Payload of an `impression.recorded` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionRecorded {
    /// Scope the impression was served under.
    pub scope: Scope,
}

/// Payload of an `intent.created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCreated {
    /// Token identifier minted for this intent.
    pub token_id: String,
    /// Scope the intent belongs to.
    pub scope: Scope,
    /// Advertiser owning the campaign, snapshotted at creation time.
    pub advertiser_id: String,
    /// Caller-supplied intent classification (e.g. `"qualified"`).
    pub intent_type: String,
    /// Optional dwell time reported by the creative runtime unit.
    pub dwell_seconds: Option<f64>,
    /// Optional interaction count reported by the creative runtime unit.
    pub interaction_count: Option<u32>,
    /// Optional parent intent this one was spawned from.
    pub parent_intent_id: Option<String>,
}

/// Payload of a `resolution.partial` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPartial {
    /// Token this resolution applies to.
    pub token_id: String,
    /// Scope of the owning token (denormalized for replay-only readers).
    pub scope: Scope,
    /// Funnel stage reported, e.g. `"lead"`.
    pub stage: String,
    /// Raw reported value.
    pub value: f64,
    /// Outcome type used for weighting, if supplied.
    pub outcome_type: Option<String>,
}

/// Payload of a `resolution.final` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionFinal {
    /// Token this resolution applies to.
    pub token_id: String,
    /// Scope of the owning token.
    pub scope: Scope,
    /// Funnel stage reported, e.g. `"purchase"`.
    pub stage: String,
    /// Raw reported value.
    pub value: f64,
    /// Outcome type used for weighting.
    pub outcome_type: String,
    /// `raw * outcome_weight(campaign, outcome_type)`.
    pub weighted_value: f64,
    /// Whether this resolution counts against caps/budget.
    pub billable: bool,
}

/// Payload of a `budget.decrement` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecrement {
    /// Campaign whose budget is decremented.
    pub campaign_id: String,
    /// Amount to subtract from `remaining`.
    pub amount: f64,
}

/// Payload of a `ledger.append` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAppendPayload {
    /// The ledger entry to append, keyed by `(token_id, final_stage)`.
    pub entry: crate::ledger::LedgerEntry,
}

/// Payload of a `token.expired` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenExpired {
    /// Token transitioning to `EXPIRED`.
    pub token_id: String,
    /// Scope of the owning token (denormalized for replay-only readers).
    pub scope: Scope,
}

/// Payload of a `window.reset` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReset {
    /// Identity (start timestamp) of the window being closed.
    pub closed_window_id: DateTime<Utc>,
    /// Identity of the window being opened.
    pub new_window_id: DateTime<Utc>,
}

/// Discriminated union of every event payload, tagged by `type` with the
/// body under `payload` — matches the wire shape in spec §3 exactly when
/// flattened into [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// `impression.recorded`
    #[serde(rename = "impression.recorded")]
    ImpressionRecorded(ImpressionRecorded),
    /// `intent.created`
    #[serde(rename = "intent.created")]
    IntentCreated(IntentCreated),
    /// `resolution.partial`
    #[serde(rename = "resolution.partial")]
    ResolutionPartial(ResolutionPartial),
    /// `resolution.final`
    #[serde(rename = "resolution.final")]
    ResolutionFinal(ResolutionFinal),
    /// `budget.decrement`
    #[serde(rename = "budget.decrement")]
    BudgetDecrement(BudgetDecrement),
    /// `ledger.append`
    #[serde(rename = "ledger.append")]
    LedgerAppend(LedgerAppendPayload),
    /// `token.expired`
    #[serde(rename = "token.expired")]
    TokenExpired(TokenExpired),
    /// `window.reset`
    #[serde(rename = "window.reset")]
    WindowReset(WindowReset),
}

impl EventPayload {
    /// The wire `type` string for this payload, e.g. `"resolution.final"`.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::ImpressionRecorded(_) => "impression.recorded",
            EventPayload::IntentCreated(_) => "intent.created",
            EventPayload::ResolutionPartial(_) => "resolution.partial",
            EventPayload::ResolutionFinal(_) => "resolution.final",
            EventPayload::BudgetDecrement(_) => "budget.decrement",
            EventPayload::LedgerAppend(_) => "ledger.append",
            EventPayload::TokenExpired(_) => "token.expired",
            EventPayload::WindowReset(_) => "window.reset",
        }
    }
}

/// A single immutable, durably-appended event.
///
/// `seq` is assigned by the event log at append time and is strictly
/// increasing and contiguous across the whole log. `event_id` is unique
/// across the entire log and is the dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing, contiguous sequence number.
    pub seq: u64,
    /// Caller-supplied or generated unique event identifier.
    pub event_id: String,
    /// Wall-clock timestamp stamped by the log at append time.
    pub ts: DateTime<Utc>,
    /// Typed payload, flattened so the wire shape carries `type`/`payload`
    /// alongside `seq`/`event_id`/`ts`.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// The wire `type` string, convenience accessor over `payload`.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}

/// A single event awaiting `seq`/`event_id`/`ts` assignment by the log.
///
/// Produced by command handlers; consumed by `appendBatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedEvent {
    /// Caller-supplied event id, or `None` to have the log generate one.
    pub event_id: Option<String>,
    /// Typed payload.
    pub payload: EventPayload,
}

impl UnassignedEvent {
    /// Build an unassigned event around `payload` with a caller-chosen id.
    pub fn with_id(event_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Some(event_id.into()),
            payload,
        }
    }

    /// Build an unassigned event around `payload`, letting the log mint an
    /// id.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape_flattens_type_and_payload() {
        let event = Event {
            seq: 1,
            event_id: "E1".to_string(),
            ts: Utc::now(),
            payload: EventPayload::ImpressionRecorded(ImpressionRecorded {
                scope: Scope {
                    campaign_id: "c".into(),
                    publisher_id: "p".into(),
                    creative_id: "cr".into(),
                },
            }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "impression.recorded");
        assert!(value["payload"]["scope"].is_object());
        assert_eq!(value["seq"], 1);

        let round_tripped: Event = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped, event);
    }
}
