// =============================================================================
// Central Application State — Coin Pulse
// =============================================================================
//
// Ties the long-lived pieces together for the HTTP/WebSocket surface:
//
//   - the loaded `PipelineConfig` (read-only after startup),
//   - the shared `Ledger` used by both the scheduler and the logging endpoints,
//   - the `IngestionScheduler` and its observable snapshot,
//   - an optional handle on the quote client for rate-limit status.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the API error ring.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::ledger::Ledger;
use crate::market_data::rate_limit::RateLimitSnapshot;
use crate::market_data::CoinGeckoClient;
use crate::runtime_config::PipelineConfig;
use crate::scheduler::{IngestionScheduler, PipelineSnapshot};

// =============================================================================
// Error Record
// =============================================================================

/// An error raised by an inbound API call (the scheduler keeps its own ring).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Taxonomy kind, e.g. `IOError`.
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent API errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Bumped on every change made through the HTTP surface.  The WebSocket
    /// feed combines it with the scheduler snapshot version.
    pub state_version: AtomicU64,

    /// Number of WebSocket messages sent across all connections.
    pub ws_sequence_number: AtomicU64,

    /// Rows appended through `/api/logPrice` and `/api/logPrediction`.
    pub manual_rows: AtomicU64,

    pub config: PipelineConfig,
    pub ledger: Arc<Ledger>,
    pub scheduler: Arc<IngestionScheduler>,
    pub quotes: Option<Arc<CoinGeckoClient>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

/// Payload of `GET /api/v1/state` and the WebSocket feed.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub asset: String,
    pub vs_currency: String,
    pub interval_seconds: u64,
    pub predictions_enabled: bool,
    pub pipeline: PipelineSnapshot,
    pub rate_limit: Option<RateLimitSnapshot>,
    pub manual_rows: u64,
    pub ws_messages_sent: u64,
    pub recent_api_errors: Vec<ErrorRecord>,
}

impl AppState {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<Ledger>,
        scheduler: Arc<IngestionScheduler>,
        quotes: Option<Arc<CoinGeckoClient>>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            ws_sequence_number: AtomicU64::new(0),
            manual_rows: AtomicU64::new(0),
            config,
            ledger,
            scheduler,
            quotes,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Local version plus the scheduler's, so either side changing is seen.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst) + self.scheduler.snapshot().version
    }

    pub fn record_manual_row(&self) {
        self.manual_rows.fetch_add(1, Ordering::Relaxed);
        self.increment_version();
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error with an optional machine-readable code.  The ring is
    /// capped at [`MAX_RECENT_ERRORS`]; oldest entries go first.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> StateSnapshot {
        let pipeline = self.scheduler.snapshot();
        StateSnapshot {
            state_version: self.state_version.load(Ordering::SeqCst) + pipeline.version,
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            asset: self.config.asset.clone(),
            vs_currency: self.config.vs_currency.clone(),
            interval_seconds: self.config.interval_seconds,
            predictions_enabled: self.config.predictions_enabled,
            pipeline,
            rate_limit: self.quotes.as_ref().map(|q| q.rate_limit()),
            manual_rows: self.manual_rows.load(Ordering::Relaxed),
            ws_messages_sent: self.ws_sequence_number.load(Ordering::Relaxed),
            recent_api_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Test support
// =============================================================================

/// State wired to unreachable services and ledgers under `dir`.
#[cfg(test)]
pub(crate) fn test_state(dir: &std::path::Path) -> Arc<AppState> {
    use crate::prediction::HttpPredictionClient;
    use crate::scheduler::SchedulerSettings;
    use std::time::Duration;

    let mut config = PipelineConfig::default();
    config.price_ledger_path = dir.join("data").join("prices.csv");
    config.prediction_ledger_path = dir.join("public").join("predictions.csv");
    config.price_api_url = "http://127.0.0.1:9".into();
    config.prediction_service_url = "http://127.0.0.1:9".into();

    let ledger = Arc::new(Ledger::new(
        &config.price_ledger_path,
        &config.prediction_ledger_path,
        config.write_ledger_headers,
    ));
    let quotes = Arc::new(
        CoinGeckoClient::new(&config.price_api_url, &config.vs_currency, Duration::from_secs(1))
            .unwrap(),
    );
    let predictor =
        Arc::new(HttpPredictionClient::new(&config.prediction_service_url, Duration::from_secs(1)).unwrap());
    let scheduler = Arc::new(IngestionScheduler::new(
        SchedulerSettings::from(&config),
        quotes.clone(),
        predictor,
        ledger.clone(),
    ));

    Arc::new(AppState::new(config, ledger, scheduler, Some(quotes)))
}
