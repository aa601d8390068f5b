#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flyback-types** – Core data model shared across the Flyback workspace.
//!
//! This crate owns the wire/disk representation of events, tokens,
//! aggregates, budgets, caps, ledger entries, the delivery cursor, and the
//! static registry/policy catalog. It performs no I/O and no business
//! logic; it is the vocabulary every other crate speaks.

pub mod error;
pub mod event;
pub mod ledger;
pub mod projection_state;
pub mod registry;
pub mod token;

pub use error::FlybackError;
pub use event::{Event, EventPayload, Scope, UnassignedEvent};
pub use ledger::LedgerEntry;
pub use projection_state::{
    AggregateWindow, Budget, CapState, DeliveryCursor, DlqEntry, ProjectionState, ScopeCounters,
};
pub use registry::{Campaign, Caps, Creative, Publisher, Registry};
pub use token::{OutcomeType, ResolutionHistoryEntry, Token, TokenStatus};

/// Current schema version stamped on persisted records and outgoing
/// webhook payloads. Bumped whenever the on-disk or wire shape changes in a
/// way a reader needs to know about.
pub const SCHEMA_VERSION: u32 = 1;
