#![forbid(unsafe_code)]

//! Flyback's process entrypoint: load config, open the event log and
//! projection engine, start the delivery pump, and serve the HTTP command
//! surface (spec §4.J, §6).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flyback_api::{
    config::Config,
    logging::init_logging,
    middleware::RateLimiter,
    routes::build_router,
    state::AppState,
};
use flyback_delivery::DeliveryPump;
use flyback_projection::{load_registry, Engine};
use flyback_selection::SelectionEngine;
use flyback_storage::EventLog;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config.log_level);

    info!("starting flyback-api v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = std::path::PathBuf::from(&config.data_dir);
    let event_log = Arc::new(
        EventLog::open(&data_dir, config.snapshot_interval)
            .await
            .context("failed to open event log")?,
    );
    let registry = Arc::new(
        load_registry(std::path::Path::new(&config.registry_path))
            .await
            .context("failed to load registry")?,
    );
    info!(publishers = registry.publishers.len(), campaigns = registry.campaigns.len(), "registry loaded");
    let engine = Arc::new(
        Engine::open(&data_dir, event_log.clone(), config.snapshot_interval, &registry)
            .await
            .context("failed to open projection engine")?,
    );

    let selection = Arc::new(SelectionEngine::new());
    let delivery = Arc::new(
        DeliveryPump::open(&data_dir, event_log.clone(), config.delivery_config())
            .await
            .context("failed to open delivery pump")?,
    );

    let bypass_ips: Vec<std::net::IpAddr> = config
        .rate_limit_bypass
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    let rate_limiter = Arc::new(RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        config.rate_limit_max,
        bypass_ips,
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        registry,
        engine: engine.clone(),
        selection,
        delivery: delivery.clone(),
        rate_limiter,
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind to port {}", config.port))?;
    info!(port = config.port, "HTTP server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    );

    let delivery_task = tokio::spawn(run_delivery_pump(delivery.clone()));

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    delivery_task.abort();
    info!("checkpointing projection before exit");
    if let Err(e) = engine.checkpoint().await {
        error!("checkpoint failed: {e}");
    }
    info!("flyback-api stopped");
    Ok(())
}

/// Tick the delivery pump on a fixed interval for the lifetime of the
/// process (spec §4.I, "a scheduled delivery task").
async fn run_delivery_pump(pump: Arc<DeliveryPump>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        match pump.tick(chrono::Utc::now()).await {
            Ok(outcome) => {
                if !matches!(outcome, flyback_delivery::TickOutcome::Idle) {
                    info!(?outcome, "delivery pump tick");
                }
            }
            Err(e) => warn!("delivery pump tick failed: {e}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
