//! CLI + environment configuration (spec §6 "Environment").

use std::time::Duration;

use clap::{Parser, ValueEnum};

/// This process's role. A `replica` never appends new events or runs the
/// delivery pump; it only serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Role {
    /// Accepts mutating commands and runs the delivery pump.
    Writer,
    /// Read-only; mutating commands reply `write_disabled`.
    Replica,
}

/// Flyback's command surface: event-sourced intent tracking, selection, and
/// webhook delivery for display-ad ingestion.
#[derive(Debug, Parser, Clone)]
#[command(name = "flyback-api", version, about)]
pub struct Config {
    /// Root directory for the event log, snapshots, registry, and DLQ.
    #[arg(long, env = "FLYBACK_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Path to the static publisher/campaign/creative registry JSON file.
    #[arg(long, env = "FLYBACK_REGISTRY_PATH", default_value = "./registry.json")]
    pub registry_path: String,

    /// This process's role.
    #[arg(long, env = "FLYBACK_ROLE", value_enum, default_value_t = Role::Writer)]
    pub role: Role,

    /// HTTP port to bind.
    #[arg(long, env = "FLYBACK_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Tracing filter, e.g. `info` or `flyback_api=debug,flyback_projection=info`.
    #[arg(long, env = "FLYBACK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Outgoing webhook URL. Omit to disable delivery entirely.
    #[arg(long, env = "FLYBACK_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Shared secret for signing outgoing webhook bodies.
    #[arg(long, env = "FLYBACK_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Webhook POST timeout, in seconds.
    #[arg(long, env = "FLYBACK_WEBHOOK_TIMEOUT_SECS", default_value_t = 5)]
    pub webhook_timeout_secs: u64,

    /// Base of the delivery pump's exponential backoff, in seconds.
    #[arg(long, env = "FLYBACK_WEBHOOK_BACKOFF_BASE_SECS", default_value_t = 1)]
    pub webhook_backoff_base_secs: u64,

    /// Ceiling of the delivery pump's exponential backoff, in seconds.
    #[arg(long, env = "FLYBACK_WEBHOOK_BACKOFF_MAX_SECS", default_value_t = 60)]
    pub webhook_backoff_max_secs: u64,

    /// Consecutive delivery failures before an event is dead-lettered.
    #[arg(long, env = "FLYBACK_WEBHOOK_MAX_RETRIES", default_value_t = 5)]
    pub webhook_max_retries: u32,

    /// Rate-limit window, in seconds, for the per-IP token bucket.
    #[arg(long, env = "FLYBACK_RATE_LIMIT_WINDOW_SECS", default_value_t = 1)]
    pub rate_limit_window_secs: u64,

    /// Maximum requests per client IP per window.
    #[arg(long, env = "FLYBACK_RATE_LIMIT_MAX", default_value_t = 20)]
    pub rate_limit_max: u32,

    /// Comma-separated IPs exempt from rate limiting.
    #[arg(long, env = "FLYBACK_RATE_LIMIT_BYPASS", value_delimiter = ',')]
    pub rate_limit_bypass: Vec<String>,

    /// Advisory file lock acquisition timeout, in seconds.
    #[arg(long, env = "FLYBACK_LOCK_TIMEOUT_SECS", default_value_t = 5)]
    pub lock_timeout_secs: u64,

    /// Advisory file lock retry interval, in milliseconds.
    #[arg(long, env = "FLYBACK_LOCK_RETRY_MS", default_value_t = 50)]
    pub lock_retry_ms: u64,

    /// Shared secret for the operator (`ops`) token used by maintenance
    /// endpoints.
    #[arg(long, env = "FLYBACK_OPS_TOKEN_SECRET")]
    pub ops_token_secret: Option<String>,

    /// Operator token time-to-live, in seconds.
    #[arg(long, env = "FLYBACK_OPS_TOKEN_TTL_SECS", default_value_t = 3600)]
    pub ops_token_ttl_secs: u64,

    /// Number of events between automatic full snapshots.
    #[arg(long, env = "FLYBACK_SNAPSHOT_INTERVAL", default_value_t = 1000)]
    pub snapshot_interval: u64,
}

impl Config {
    /// Parse from `std::env::args()`, having first loaded a `.env` file if
    /// one is present.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Config::parse()
    }

    /// Whether this process accepts mutating commands.
    pub fn writes_enabled(&self) -> bool {
        self.role == Role::Writer
    }

    /// Delivery pump configuration derived from these settings.
    pub fn delivery_config(&self) -> flyback_delivery::DeliveryConfig {
        flyback_delivery::DeliveryConfig {
            webhook_url: self.webhook_url.clone(),
            webhook_secret: self.webhook_secret.clone(),
            timeout: Duration::from_secs(self.webhook_timeout_secs),
            backoff_base: Duration::from_secs(self.webhook_backoff_base_secs),
            backoff_max: Duration::from_secs(self.webhook_backoff_max_secs),
            max_retries: self.webhook_max_retries,
            writes_enabled: self.writes_enabled(),
        }
    }
}
