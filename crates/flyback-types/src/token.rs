//! Intent Event Tokens (spec §3 "Token", GLOSSARY "IET").

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Scope;

/// Default token lifetime if not otherwise configured.
pub const DEFAULT_TOKEN_TTL_DAYS: i64 = 30;

/// Lifecycle status of a token. Once `Resolved`, `resolved_at` /
/// `resolved_value` are write-once (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenStatus {
    /// Minted by `intent.created`, no resolution observed yet.
    Created,
    /// Alias status used while awaiting first resolution; kept distinct
    /// from `Created` so reducers can express "has seen a partial".
    Pending,
    /// A final resolution has been applied; status is now immutable.
    Resolved,
    /// The token passed `expires_at` without ever resolving.
    Expired,
}

/// The outcome classification used to look up a campaign's weight table.
pub type OutcomeType = String;

/// One entry in a token's resolution history. Every postback — partial or
/// final, in-order or out-of-order — appends one of these; only a fresh
/// final resolution changes `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionHistoryEntry {
    /// Funnel stage reported (`lead`, `purchase`, `resolved`, ...).
    pub stage: String,
    /// When this resolution was recorded.
    pub resolved_at: DateTime<Utc>,
    /// Raw value reported.
    pub resolved_value: f64,
    /// Outcome type used for weighting, when known.
    pub outcome_type: Option<String>,
    /// Whether this specific entry was the one that finalized the token.
    pub is_final: bool,
}

/// An Intent Event Token: the in-frame user-intent record produced by
/// `intent.created` and mutated only by `resolution.*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Unique token identifier.
    pub token_id: String,
    /// `(campaign, publisher, creative)` this token was issued under.
    pub scope: Scope,
    /// Advertiser owning the campaign, snapshotted at creation time.
    pub advertiser_id: String,
    /// Current lifecycle status.
    pub status: TokenStatus,
    /// When the token was created.
    pub created_at: DateTime<Utc>,
    /// When the token becomes eligible for expiry (default +30 days).
    pub expires_at: DateTime<Utc>,
    /// Timestamp of the first postback seen, if any.
    pub pending_at: Option<DateTime<Utc>>,
    /// Set exactly once, the first time a fresh final resolution applies.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set exactly once alongside `resolved_at`.
    pub resolved_value: Option<f64>,
    /// Set exactly once alongside `resolved_at`.
    pub outcome_type: Option<OutcomeType>,
    /// Whether the finalizing resolution counted against caps/budget.
    pub billable: bool,
    /// Every resolution observed, in append order, including entries after
    /// the token was already resolved (spec §9 open question).
    pub resolution_events: Vec<ResolutionHistoryEntry>,
    /// Per-`(stage)` idempotence guard: stages already acknowledged.
    pub acknowledged_stages: Vec<String>,
}

impl Token {
    /// Mint a new token in `Created`/`Pending` status.
    pub fn new(
        token_id: impl Into<String>,
        scope: Scope,
        advertiser_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            scope,
            advertiser_id: advertiser_id.into(),
            status: TokenStatus::Pending,
            created_at,
            expires_at: created_at + Duration::days(DEFAULT_TOKEN_TTL_DAYS),
            pending_at: Some(created_at),
            resolved_at: None,
            resolved_value: None,
            outcome_type: None,
            billable: false,
            resolution_events: Vec::new(),
            acknowledged_stages: Vec::new(),
        }
    }

    /// True once `status == Resolved`.
    pub fn is_resolved(&self) -> bool {
        self.status == TokenStatus::Resolved
    }

    /// True if `now` is past `expires_at` and the token never resolved.
    pub fn is_expirable(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved() && now > self.expires_at
    }

    /// Whether `stage` has already produced a reply for this token
    /// (idempotence per spec §4.J).
    pub fn has_acknowledged(&self, stage: &str) -> bool {
        self.acknowledged_stages.iter().any(|s| s == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            campaign_id: "c".into(),
            publisher_id: "p".into(),
            creative_id: "cr".into(),
        }
    }

    #[test]
    fn new_token_expires_in_thirty_days() {
        let now = Utc::now();
        let token = Token::new("t1", scope(), "adv", now);
        assert_eq!(token.status, TokenStatus::Pending);
        assert_eq!((token.expires_at - now).num_days(), 30);
        assert!(!token.is_expirable(now));
        assert!(token.is_expirable(now + Duration::days(31)));
    }
}
