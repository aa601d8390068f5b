#![forbid(unsafe_code)]

//! **flyback-selection** – deterministic creative selection (spec §4.G) and
//! publisher-scoped reporting views (spec §4.H), both pure functions over a
//! read-only projection snapshot.

pub mod reporting;
pub mod selection;

pub use reporting::{build_report, AggregateRow, CapReport, DeliveryHealth, LastWindowObserved, LedgerStats, PublisherPolicy, PublisherReport};
pub use selection::{
    select, ChosenCreative, MetricUsed, ScoredCandidate, SelectionDecision, SelectionEngine, DIVERGENCE_THRESHOLD,
    DIVERGENCE_WINDOW_STREAK, NEAR_BUDGET_EXHAUSTION_RATIO, NEAR_CAP_EXHAUSTION_RATIO, SELECTION_HISTORY_CAPACITY,
};
