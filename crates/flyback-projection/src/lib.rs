#![forbid(unsafe_code)]

//! **flyback-projection** – the deterministic reducer over the event
//! stream (spec §4.E) and the static registry/policy loader (spec §4.F).

pub mod engine;
pub mod reducer;
pub mod registry;

pub use engine::{Engine, EngineError, SubmitOutcome};
pub use reducer::{reduce, ReducerError, WINDOW_DURATION};
pub use registry::{load_registry, RegistryError};
