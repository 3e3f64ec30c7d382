// =============================================================================
// Ingestion Scheduler — the fetch → compute → persist → predict cycle
// =============================================================================
//
// One cycle per tick:
//
//   Idle → Fetching → Computing → Persisting → Predicting → Idle
//
//   1. Fetch the current quote and the N-day history concurrently.
//   2. Merge them, compute MA7 / MA30 / RSI, keep the latest values.
//   3. If all three are present, append a row to the price ledger.
//   4. Request a prediction, append it to the prediction ledger, then trigger
//      a retrain on the model service (acknowledgement only).
//
// Any failure ends that cycle only: it is logged, counted and recorded in
// the error ring, and the next tick starts from scratch.
//
// At most one cycle runs at a time.  A tick arriving while a cycle is still
// in flight is skipped, never queued.  Every network step is bounded by
// `request_timeout`.
//
// Observable state lives in a `tokio::sync::watch` channel: `snapshot()` is
// the read-only accessor, `subscribe()` hands out change notifications.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{FetchError, PipelineError, PredictionError, RetrainError};
use crate::indicators::{self, IndicatorPeriods};
use crate::ledger::Ledger;
use crate::market_data::PriceSource;
use crate::prediction::PredictionService;
use crate::runtime_config::PipelineConfig;
use crate::types::{CyclePhase, IndicatorSnapshot, IndicatorVector, PredictionRecord};

/// Maximum number of recent cycle errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// Settings
// =============================================================================

/// The subset of [`PipelineConfig`] the scheduler runs on.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub asset: String,
    pub history_days: u32,
    pub periods: IndicatorPeriods,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub predictions_enabled: bool,
    pub retrain_every: u32,
}

impl From<&PipelineConfig> for SchedulerSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            asset: cfg.asset.clone(),
            history_days: cfg.history_days,
            periods: cfg.periods,
            interval: cfg.interval(),
            request_timeout: cfg.request_timeout(),
            predictions_enabled: cfg.predictions_enabled,
            retrain_every: cfg.retrain_every.max(1),
        }
    }
}

// =============================================================================
// Observable state
// =============================================================================

/// What a finished cycle achieved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Not enough history for every indicator; nothing persisted.
    Incomplete,
    /// Price row persisted; predictions are disabled.
    Logged,
    /// Price row and prediction row persisted.
    Predicted { prediction: f64, retrain: RetrainStatus },
}

/// Result of the retrain step of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainStatus {
    Accepted,
    Failed,
    NotDue,
}

/// A recorded cycle error for the status feed.
#[derive(Debug, Clone, Serialize)]
pub struct CycleErrorRecord {
    pub cycle: u64,
    pub phase: CyclePhase,
    /// Taxonomy kind, e.g. `FetchError`.
    pub kind: &'static str,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Summary of one finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: Option<CycleOutcome>,
    pub failure: Option<CycleErrorRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleCounters {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub consecutive_failures: u64,
}

/// Read-only view of the pipeline handed to the presentation layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot {
    pub asset: String,
    pub phase: CyclePhase,
    pub in_flight: bool,
    pub current_cycle: Option<u64>,
    pub latest_indicators: Option<IndicatorSnapshot>,
    pub latest_prediction: Option<PredictionRecord>,
    pub last_cycle: Option<CycleReport>,
    pub counters: CycleCounters,
    pub recent_errors: Vec<CycleErrorRecord>,
    /// Incremented on every published change.
    pub version: u64,
}

/// What a tick did.
pub enum TickOutcome {
    Started {
        cycle: u64,
        handle: JoinHandle<CycleReport>,
    },
    Skipped,
}

/// A cycle that ended early, with the phase it was in.
#[derive(Debug)]
struct CycleFailure {
    phase: CyclePhase,
    error: PipelineError,
}

fn at<E: Into<PipelineError>>(phase: CyclePhase) -> impl FnOnce(E) -> CycleFailure {
    move |e| CycleFailure {
        phase,
        error: e.into(),
    }
}

// =============================================================================
// IngestionScheduler
// =============================================================================

pub struct IngestionScheduler {
    settings: SchedulerSettings,
    source: Arc<dyn PriceSource>,
    predictor: Arc<dyn PredictionService>,
    ledger: Arc<Ledger>,
    in_flight: AtomicBool,
    cycle_seq: AtomicU64,
    predictions_since_retrain: AtomicU32,
    state: watch::Sender<PipelineSnapshot>,
}

impl IngestionScheduler {
    pub fn new(
        settings: SchedulerSettings,
        source: Arc<dyn PriceSource>,
        predictor: Arc<dyn PredictionService>,
        ledger: Arc<Ledger>,
    ) -> Self {
        let initial = PipelineSnapshot {
            asset: settings.asset.clone(),
            ..PipelineSnapshot::default()
        };
        let (state, _) = watch::channel(initial);

        Self {
            settings,
            source,
            predictor,
            ledger,
            in_flight: AtomicBool::new(false),
            cycle_seq: AtomicU64::new(0),
            predictions_since_retrain: AtomicU32::new(0),
            state,
        }
    }

    /// Current pipeline state.
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.state.subscribe()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    // ── Run loop ────────────────────────────────────────────────────────

    /// Tick every `interval` until `shutdown` flips to `true` (or its sender
    /// is dropped), then wait a bounded time for the in-flight cycle.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<CycleReport>> = None;

        info!(
            asset = %self.settings.asset,
            interval_secs = self.settings.interval.as_secs_f64(),
            "ingestion scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let TickOutcome::Started { cycle, handle } = self.trigger() {
                        debug!(cycle, "tick started cycle");
                        current = Some(handle);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = current.filter(|h| !h.is_finished()) {
            info!("waiting for in-flight cycle before shutdown");
            // Fetch, predict and retrain are each bounded by the timeout.
            let grace = self.settings.request_timeout * 3 + Duration::from_secs(1);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("in-flight cycle did not finish before shutdown grace period");
            }
        }

        info!("ingestion scheduler stopped");
    }

    /// Start a cycle unless one is already in flight.
    pub fn trigger(self: &Arc<Self>) -> TickOutcome {
        let Some(guard) = InFlightGuard::acquire(self.clone()) else {
            self.publish(|s| s.counters.skipped += 1);
            debug!("previous cycle still in flight — tick skipped");
            return TickOutcome::Skipped;
        };

        let cycle = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.execute(cycle).await
        });

        TickOutcome::Started { cycle, handle }
    }

    // ── Cycle ───────────────────────────────────────────────────────────

    async fn execute(&self, cycle: u64) -> CycleReport {
        let started_at = Utc::now().to_rfc3339();
        self.publish(|s| {
            s.counters.started += 1;
            s.current_cycle = Some(cycle);
            s.in_flight = true;
        });
        info!(cycle, asset = %self.settings.asset, "cycle started");

        let result = self.run_cycle(cycle).await;
        let finished_at = Utc::now().to_rfc3339();

        let report = match result {
            Ok(outcome) => {
                info!(cycle, outcome = ?outcome, "cycle finished");
                CycleReport {
                    cycle,
                    started_at,
                    finished_at,
                    outcome: Some(outcome),
                    failure: None,
                }
            }
            Err(failure) => {
                error!(
                    cycle,
                    phase = %failure.phase,
                    kind = failure.error.kind(),
                    error = %failure.error,
                    "cycle failed"
                );
                CycleReport {
                    cycle,
                    started_at,
                    finished_at,
                    outcome: None,
                    failure: Some(error_record(cycle, failure.phase, &failure.error)),
                }
            }
        };

        let summary = report.clone();
        self.publish(move |s| {
            match &summary.failure {
                None => {
                    s.counters.completed += 1;
                    s.counters.consecutive_failures = 0;
                }
                Some(record) => {
                    s.counters.failed += 1;
                    s.counters.consecutive_failures += 1;
                    push_error(&mut s.recent_errors, record.clone());
                }
            }
            s.phase = CyclePhase::Idle;
            s.last_cycle = Some(summary);
        });

        report
    }

    async fn run_cycle(&self, cycle: u64) -> Result<CycleOutcome, CycleFailure> {
        let asset = self.settings.asset.as_str();
        let limit = self.settings.request_timeout;

        // ── Fetching ──
        self.set_phase(CyclePhase::Fetching);
        let (current, history) = tokio::join!(
            bounded(limit, self.source.current_price(asset), FetchError::Timeout),
            bounded(
                limit,
                self.source.history(asset, self.settings.history_days),
                FetchError::Timeout
            ),
        );
        let mut series = history.map_err(at(CyclePhase::Fetching))?;
        let current = current.map_err(at(CyclePhase::Fetching))?;
        debug!(cycle, points = series.len(), price = current.price, "prices fetched");
        series.push(current);

        // ── Computing ──
        self.set_phase(CyclePhase::Computing);
        let snapshot = indicators::snapshot_latest(&mut series, self.settings.periods)
            .map_err(at(CyclePhase::Computing))?;
        let Some(snapshot) = snapshot else {
            return Ok(CycleOutcome::Incomplete);
        };
        self.publish(|s| s.latest_indicators = Some(snapshot));

        let Some(record) = snapshot.to_ledger_record() else {
            info!(
                cycle,
                ma7 = ?snapshot.ma7,
                ma30 = ?snapshot.ma30,
                rsi = ?snapshot.rsi,
                "insufficient history for all indicators — nothing persisted"
            );
            return Ok(CycleOutcome::Incomplete);
        };

        // ── Persisting ──
        self.set_phase(CyclePhase::Persisting);
        self.ledger
            .append_price(&record)
            .map_err(at(CyclePhase::Persisting))?;
        info!(
            cycle,
            price = record.price,
            ma7 = record.ma7,
            ma30 = record.ma30,
            rsi = record.rsi,
            rsi_zone = indicators::rsi::label(record.rsi),
            "price row persisted"
        );

        if !self.settings.predictions_enabled {
            return Ok(CycleOutcome::Logged);
        }

        // ── Predicting ──
        self.set_phase(CyclePhase::Predicting);
        let features = IndicatorVector {
            ma7: record.ma7,
            ma30: record.ma30,
            rsi: record.rsi,
        };
        let prediction = bounded(
            limit,
            self.predictor.request_prediction(&features),
            PredictionError::Timeout,
        )
        .await
        .map_err(at(CyclePhase::Predicting))?;

        let prediction_record = PredictionRecord::ahead_of(Utc::now(), prediction);
        self.ledger
            .append_prediction(&prediction_record)
            .map_err(at(CyclePhase::Predicting))?;
        self.publish(|s| s.latest_prediction = Some(prediction_record));
        info!(cycle, prediction, "prediction persisted");

        let retrain = self.maybe_retrain(cycle, limit).await;
        Ok(CycleOutcome::Predicted {
            prediction,
            retrain,
        })
    }

    /// Trigger a retrain when due.  Failures are logged and recorded, never
    /// propagated.
    async fn maybe_retrain(&self, cycle: u64, limit: Duration) -> RetrainStatus {
        let count = self.predictions_since_retrain.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.settings.retrain_every {
            return RetrainStatus::NotDue;
        }
        self.predictions_since_retrain.store(0, Ordering::SeqCst);

        match bounded(limit, self.predictor.trigger_retrain(), RetrainError::Timeout).await {
            Ok(ack) => {
                debug!(cycle, message = ?ack.message, "retrain accepted");
                RetrainStatus::Accepted
            }
            Err(e) => {
                let e = PipelineError::from(e);
                warn!(cycle, kind = e.kind(), error = %e, "retrain trigger failed");
                let record = error_record(cycle, CyclePhase::Predicting, &e);
                self.publish(|s| push_error(&mut s.recent_errors, record));
                RetrainStatus::Failed
            }
        }
    }

    // ── State helpers ───────────────────────────────────────────────────

    fn set_phase(&self, phase: CyclePhase) {
        self.publish(|s| s.phase = phase);
    }

    fn publish(&self, f: impl FnOnce(&mut PipelineSnapshot)) {
        self.state.send_modify(|s| {
            f(s);
            s.version += 1;
        });
    }
}

/// Clears the in-flight flag when the cycle task ends, however it ends.
struct InFlightGuard {
    scheduler: Arc<IngestionScheduler>,
}

impl InFlightGuard {
    fn acquire(scheduler: Arc<IngestionScheduler>) -> Option<Self> {
        scheduler
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(Self { scheduler })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Publish first; once the flag clears the next cycle owns the state.
        self.scheduler.publish(|s| {
            s.in_flight = false;
            s.current_cycle = None;
            s.phase = CyclePhase::Idle;
        });
        self.scheduler.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Await `fut`, failing with `on_timeout(limit)` if it takes longer.
async fn bounded<T, E, F>(limit: Duration, fut: F, on_timeout: fn(Duration) -> E) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(on_timeout(limit)),
    }
}

fn error_record(cycle: u64, phase: CyclePhase, e: &PipelineError) -> CycleErrorRecord {
    CycleErrorRecord {
        cycle,
        phase,
        kind: e.kind(),
        message: e.to_string(),
        at: Utc::now().to_rfc3339(),
    }
}

fn push_error(errors: &mut Vec<CycleErrorRecord>, record: CycleErrorRecord) {
    errors.push(record);
    while errors.len() > MAX_RECENT_ERRORS {
        errors.remove(0);
    }
}
