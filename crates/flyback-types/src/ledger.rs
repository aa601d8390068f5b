//! Immutable payout ledger (spec §3 "Ledger entry").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One payout record. Uniqueness is enforced on `(token_id, final_stage)`
/// by the projection engine before an entry is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub entry_id: String,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// Token this payout is derived from.
    pub token_id: String,
    /// Owning campaign.
    pub campaign_id: String,
    /// Owning advertiser.
    pub advertiser_id: String,
    /// Publisher the impression/intent was served to.
    pub publisher_id: String,
    /// Creative that was shown.
    pub creative_id: String,
    /// Identity of the aggregation window the resolution landed in.
    pub window_id: DateTime<Utc>,
    /// Outcome classification used for weighting.
    pub outcome_type: String,
    /// Raw reported value.
    pub raw_value: f64,
    /// `raw_value * outcome_weight`.
    pub weighted_value: f64,
    /// Always `true` — only billable resolutions produce ledger entries.
    pub billable: bool,
    /// `round(raw_value * 100 * rev_share_bps / 10_000)`.
    pub payout_cents: i64,
    /// Publisher revenue share in basis points, as applied.
    pub rev_share_bps: u32,
    /// The funnel stage that finalized the owning token.
    pub final_stage: String,
}

/// Compute `payout_cents = round(raw_value * 100 * rev_share_bps / 10_000)`
/// (spec GLOSSARY "Rev-share bps").
pub fn payout_cents(raw_value: f64, rev_share_bps: u32) -> i64 {
    (raw_value * 100.0 * rev_share_bps as f64 / 10_000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_cents_matches_scenario_s1() {
        // S1: raw=5, rev_share=7000bps -> round(5*100*0.7) = 350
        assert_eq!(payout_cents(5.0, 7000), 350);
    }
}
