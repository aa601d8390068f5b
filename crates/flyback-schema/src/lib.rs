#![forbid(unsafe_code)]

//! **flyback-schema** – Declarative shape validation (spec §4.B).
//!
//! Schemas are authored as JSON Schema draft-07 documents
//! (`{type, required, properties, items, enum, additionalProperties}`) and
//! compiled once with the [`jsonschema`] crate. Validation is applied to
//! every persisted event on load and on append, every loaded
//! registry/policy/keys file, every DLQ entry, and every outgoing report
//! view — violations on report views are logged, not fatal; everywhere
//! else a violation is the caller's `invalid_*`/fatal path (spec §4.B,
//! §7).

use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;

pub mod schemas;

/// A compiled draft-07 schema, ready to validate many documents.
pub struct CompiledSchema {
    raw: Value,
    compiled: JSONSchema,
}

/// Error compiling a schema document itself. Only ever produced for a
/// built-in schema, which is a programmer error — callers should treat
/// this as fatal at startup.
#[derive(Debug, Error)]
#[error("schema does not compile under draft-07: {0}")]
pub struct SchemaCompileError(String);

/// One shape violation found while validating a document against a
/// compiled schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON Pointer into the instance where the violation occurred.
    pub instance_path: String,
    /// Human-readable description of the violation.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.instance_path, self.message)
    }
}

impl CompiledSchema {
    /// Compile `raw` (a JSON Schema draft-07 document) once. Returns
    /// [`SchemaCompileError`] if the document itself is malformed — this
    /// should only happen for a built-in schema and indicates a bug here,
    /// not bad input data.
    pub fn compile(raw: Value) -> Result<Self, SchemaCompileError> {
        let compiled = JSONSchema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .compile(&raw)
            .map_err(|e| SchemaCompileError(e.to_string()))?;
        Ok(Self { raw, compiled })
    }

    /// Validate `instance` against this schema, collecting every
    /// violation rather than stopping at the first.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<Violation>> {
        let result = self.compiled.validate(instance);
        match result {
            Ok(()) => Ok(()),
            Err(errors) => {
                let violations = errors
                    .map(|e| Violation {
                        instance_path: e.instance_path.to_string(),
                        message: e.to_string(),
                    })
                    .collect::<Vec<_>>();
                Err(violations)
            }
        }
    }

    /// The raw JSON Schema document this was compiled from, for
    /// diagnostics.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_required_field() {
        let schema = CompiledSchema::compile(json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } },
            "additionalProperties": false,
        }))
        .unwrap();

        assert!(schema.validate(&json!({ "name": "ok" })).is_ok());
        let violations = schema.validate(&json!({})).unwrap_err();
        assert!(!violations.is_empty());
    }
}
