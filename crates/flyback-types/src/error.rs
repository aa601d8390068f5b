//! Shared error taxonomy (spec §4.M / §7).

use thiserror::Error;

/// Domain error taxonomy shared by every Flyback crate.
///
/// Library code returns this type (or a crate-local error that converts
/// into it at the boundary); `anyhow::Error` is reserved for the axum
/// handler layer and `main`.
#[derive(Debug, Error)]
pub enum FlybackError {
    /// Caller-supplied data failed shape or semantic validation. Never
    /// mutates state; maps to `400 invalid_*`.
    #[error("invalid_{code}: {message}")]
    Validation {
        /// Short machine-readable code, e.g. `publisher_id`.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// A reference to a publisher/campaign/creative/advertiser does not
    /// exist or does not match its expected owner.
    #[error("referential error: {0}")]
    Referential(String),

    /// The requested mutation is a no-op because it was already observed
    /// (`already_resolved`) or the resource already transitioned
    /// (`already_expired`).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lock or mutex could not be acquired within its timeout.
    #[error("contention: {0}")]
    Contention(String),

    /// An outbound delivery attempt failed transiently and may be retried.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// An invariant that should never be observably violated was violated.
    /// The process should exit so an operator can repair on restart.
    #[error("fatal integrity violation: {0}")]
    Fatal(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FlybackError>;
