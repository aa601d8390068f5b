#![forbid(unsafe_code)]

//! **flyback-api** – the HTTP command surface: `fill`/`intent`/`postback`
//! (spec §4.J), publisher reports and delivery health (spec §4.H, §4.I),
//! rate limiting and security headers (spec §5, §6), and process wiring
//! (config, logging).

pub mod commands;
pub mod config;
pub mod logging;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::Config;
pub use routes::build_router;
pub use state::AppState;
