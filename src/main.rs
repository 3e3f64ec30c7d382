// =============================================================================
// Coin Pulse — Main Entry Point
// =============================================================================
//
// Polls a public quote API on a fixed interval, derives MA7 / MA30 / RSI,
// appends the results to a CSV ledger, asks an external model service for a
// one-minute-ahead prediction and nudges it to retrain.  A small axum server
// exposes status, a WebSocket feed and the manual logging endpoints.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod indicators;
mod ledger;
mod market_data;
mod prediction;
mod runtime_config;
mod scheduler;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::ledger::Ledger;
use crate::market_data::CoinGeckoClient;
use crate::prediction::HttpPredictionClient;
use crate::runtime_config::PipelineConfig;
use crate::scheduler::{IngestionScheduler, SchedulerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Coin Pulse starting up");

    let config_path =
        std::env::var("COIN_PULSE_CONFIG").unwrap_or_else(|_| "pipeline_config.json".into());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate().context("invalid pipeline configuration")?;

    info!(
        asset = %config.asset,
        vs_currency = %config.vs_currency,
        interval_seconds = config.interval_seconds,
        predictions_enabled = config.predictions_enabled,
        "Pipeline configured"
    );

    // ── 2. Clients & ledger ──────────────────────────────────────────────
    let timeout = config.request_timeout();
    let quotes = Arc::new(
        CoinGeckoClient::new(&config.price_api_url, &config.vs_currency, timeout)
            .context("failed to build quote client")?,
    );
    let predictor = Arc::new(
        HttpPredictionClient::new(&config.prediction_service_url, timeout)
            .context("failed to build prediction client")?,
    );
    let ledger = Arc::new(Ledger::new(
        &config.price_ledger_path,
        &config.prediction_ledger_path,
        config.write_ledger_headers,
    ));
    info!(
        prices = %ledger.price_path().display(),
        predictions = %ledger.prediction_path().display(),
        "Ledgers ready"
    );

    // ── 3. Scheduler & shared state ──────────────────────────────────────
    let scheduler = Arc::new(IngestionScheduler::new(
        SchedulerSettings::from(&config),
        quotes.clone(),
        predictor,
        ledger.clone(),
    ));
    let state = Arc::new(AppState::new(
        config.clone(),
        ledger,
        scheduler.clone(),
        Some(quotes),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx));

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let grace = config.request_timeout() * 3 + Duration::from_secs(2);
    match tokio::time::timeout(grace, scheduler_task).await {
        Ok(Ok(())) => info!("Scheduler stopped cleanly"),
        Ok(Err(e)) => error!(error = %e, "Scheduler task panicked"),
        Err(_) => warn!("Scheduler did not stop in time"),
    }

    Ok(())
}
