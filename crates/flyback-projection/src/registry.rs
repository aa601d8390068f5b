//! Static registry/policy loading with referential-integrity enforcement
//! (spec §4.F).

use std::path::Path;

use flyback_schema::schemas::REGISTRY_FILE;
use flyback_types::Registry;
use thiserror::Error;

/// Errors raised loading the static catalog. Every variant here is fatal
/// at startup per spec §4.F ("unknown advertiser/creative/campaign =
/// fatal").
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure reading the registry file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The file did not parse as JSON.
    #[error("malformed registry JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// The document didn't match the declarative registry shape.
    #[error("registry file failed schema validation: {0:?}")]
    Schema(Vec<String>),
    /// A campaign references a creative id the catalog doesn't define.
    #[error("campaign {campaign_id} references unknown creative {creative_id}")]
    UnknownCreative { campaign_id: String, creative_id: String },
    /// A campaign references a publisher id the catalog doesn't define.
    #[error("campaign {campaign_id} references unknown publisher {publisher_id}")]
    UnknownPublisher { campaign_id: String, publisher_id: String },
}

/// Load and referentially validate the registry at `path`. Any failure
/// here is a fatal startup condition — the caller should exit rather than
/// run with a partially-consistent catalog.
pub async fn load_registry(path: &Path) -> Result<Registry, RegistryError> {
    let bytes = tokio::fs::read(path).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;

    if let Err(violations) = REGISTRY_FILE.validate(&value) {
        return Err(RegistryError::Schema(violations.into_iter().map(|v| v.to_string()).collect()));
    }

    let registry: Registry = serde_json::from_value(value)?;
    validate_referential_integrity(&registry)?;
    Ok(registry)
}

fn validate_referential_integrity(registry: &Registry) -> Result<(), RegistryError> {
    for campaign in registry.campaigns.values() {
        if !registry.publishers.contains_key(&campaign.publisher_id) {
            return Err(RegistryError::UnknownPublisher {
                campaign_id: campaign.campaign_id.clone(),
                publisher_id: campaign.publisher_id.clone(),
            });
        }
        for creative_id in &campaign.creative_ids {
            if !registry.creatives.contains_key(creative_id) {
                return Err(RegistryError::UnknownCreative {
                    campaign_id: campaign.campaign_id.clone(),
                    creative_id: creative_id.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rejects_campaign_referencing_unknown_creative() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "publishers": { "publisher-demo": {
                    "publisher_id": "publisher-demo", "selection_mode": "raw", "floor_type": "raw",
                    "floor_value_per_1k": 0.0, "allowed_demand_types": ["display"],
                    "demand_priority": ["display"], "rev_share_bps": 7000
                }},
                "campaigns": { "campaign-v1": {
                    "campaign_id": "campaign-v1", "publisher_id": "publisher-demo", "advertiser_id": "advertiser-demo",
                    "creative_ids": ["missing-creative"], "outcome_weights": {}, "caps": { "max_outcomes": 10, "max_weighted_value": 200.0 },
                    "budget_total": 120.0, "publisher_rev_share_bps": null
                }},
                "creatives": {},
            })).unwrap(),
        ).await.unwrap();

        let err = load_registry(&path).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCreative { .. }));
    }
}
