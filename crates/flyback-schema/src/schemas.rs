//! Built-in declarative schemas for events, registry files, DLQ entries,
//! and report views (spec §4.B).

use once_cell::sync::Lazy;
use serde_json::json;

use crate::CompiledSchema;

fn scope_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["campaign_id", "publisher_id", "creative_id"],
        "properties": {
            "campaign_id": { "type": "string", "minLength": 1 },
            "publisher_id": { "type": "string", "minLength": 1 },
            "creative_id": { "type": "string", "minLength": 1 },
        },
        "additionalProperties": false,
    })
}

/// Schema for the event envelope as it sits on disk: `{seq, event_id, ts,
/// type, payload}` with `type` constrained to the closed set from spec §3.
pub static EVENT_ENVELOPE: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["seq", "event_id", "ts", "type", "payload"],
        "properties": {
            "seq": { "type": "integer", "minimum": 1 },
            "event_id": { "type": "string", "minLength": 1 },
            "ts": { "type": "string" },
            "type": {
                "type": "string",
                "enum": [
                    "impression.recorded",
                    "intent.created",
                    "resolution.partial",
                    "resolution.final",
                    "budget.decrement",
                    "ledger.append",
                    "token.expired",
                    "window.reset",
                ],
            },
            "payload": { "type": "object" },
        },
        "additionalProperties": false,
    }))
    .expect("built-in event envelope schema must compile")
});

/// Schema for an `intent.created` payload.
pub static INTENT_CREATED_PAYLOAD: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["token_id", "scope", "advertiser_id", "intent_type"],
        "properties": {
            "token_id": { "type": "string", "minLength": 1 },
            "scope": scope_schema(),
            "advertiser_id": { "type": "string", "minLength": 1 },
            "intent_type": { "type": "string", "minLength": 1 },
            "dwell_seconds": { "type": ["number", "null"] },
            "interaction_count": { "type": ["integer", "null"] },
            "parent_intent_id": { "type": ["string", "null"] },
        },
        "additionalProperties": false,
    }))
    .expect("built-in intent.created schema must compile")
});

/// Schema for a `resolution.final` payload.
pub static RESOLUTION_FINAL_PAYLOAD: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["token_id", "scope", "stage", "value", "outcome_type", "weighted_value", "billable"],
        "properties": {
            "token_id": { "type": "string", "minLength": 1 },
            "scope": scope_schema(),
            "stage": { "type": "string", "minLength": 1 },
            "value": { "type": "number" },
            "outcome_type": { "type": "string", "minLength": 1 },
            "weighted_value": { "type": "number" },
            "billable": { "type": "boolean" },
        },
        "additionalProperties": false,
    }))
    .expect("built-in resolution.final schema must compile")
});

/// Schema for the on-disk registry/policy catalog (spec §4.F).
pub static REGISTRY_FILE: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["publishers", "campaigns", "creatives"],
        "properties": {
            "publishers": { "type": "object" },
            "campaigns": { "type": "object" },
            "creatives": { "type": "object" },
        },
        "additionalProperties": false,
    }))
    .expect("built-in registry schema must compile")
});

/// Schema for one dead-letter journal line (spec §3 "DLQ entry").
pub static DLQ_ENTRY: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["failed_at", "seq", "event_id", "error", "payload"],
        "properties": {
            "failed_at": { "type": "string" },
            "seq": { "type": "integer", "minimum": 1 },
            "event_id": { "type": "string", "minLength": 1 },
            "status": { "type": ["integer", "null"] },
            "error": { "type": "string" },
            "payload": { "type": "object" },
        },
        "additionalProperties": false,
    }))
    .expect("built-in DLQ entry schema must compile")
});

/// Schema for an outgoing publisher report view (spec §4.H). Violations
/// against this schema are logged, never fatal (spec §4.B).
pub static REPORT_VIEW: Lazy<CompiledSchema> = Lazy::new(|| {
    CompiledSchema::compile(json!({
        "type": "object",
        "required": ["publisher_id", "aggregate_rows", "caps", "ledger_stats"],
        "properties": {
            "publisher_id": { "type": "string", "minLength": 1 },
            "aggregate_rows": { "type": "array" },
            "caps": { "type": "array" },
            "ledger_stats": { "type": "object" },
        },
        "additionalProperties": true,
    }))
    .expect("built-in report view schema must compile")
});

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_envelope_accepts_a_well_formed_event() {
        let instance = json!({
            "seq": 1,
            "event_id": "E1",
            "ts": "2026-01-01T00:00:00Z",
            "type": "impression.recorded",
            "payload": { "scope": { "campaign_id": "c", "publisher_id": "p", "creative_id": "cr" } },
        });
        assert!(EVENT_ENVELOPE.validate(&instance).is_ok());
    }

    #[test]
    fn event_envelope_rejects_unknown_type() {
        let instance = json!({
            "seq": 1,
            "event_id": "E1",
            "ts": "2026-01-01T00:00:00Z",
            "type": "bogus.event",
            "payload": {},
        });
        assert!(EVENT_ENVELOPE.validate(&instance).is_err());
    }
}
