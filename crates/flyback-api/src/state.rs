//! Shared application state handed to every axum handler.

use std::sync::Arc;

use flyback_delivery::DeliveryPump;
use flyback_projection::Engine;
use flyback_selection::SelectionEngine;
use flyback_types::registry::Registry;

use crate::config::Config;
use crate::middleware::RateLimiter;

/// Cloned into every request; everything inside is already `Arc`/cheap to
/// clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub engine: Arc<Engine>,
    pub selection: Arc<SelectionEngine>,
    pub delivery: Arc<DeliveryPump>,
    pub rate_limiter: Arc<RateLimiter>,
}
