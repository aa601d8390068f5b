#![forbid(unsafe_code)]

//! **flyback-delivery** – the webhook delivery pump: cursor persistence,
//! HMAC signing, exponential backoff, and the dead-letter queue (spec §4.I).

pub mod cursor;
pub mod dlq;
pub mod pump;
pub mod signing;

pub use cursor::CursorStore;
pub use dlq::DlqStore;
pub use pump::{DeliveryConfig, DeliveryError, DeliveryPump, TickOutcome};
pub use signing::sign;
