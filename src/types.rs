// =============================================================================
// Shared types used across the price pipeline
// =============================================================================

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used by both CSV ledgers.
pub const LEDGER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How far ahead of the append instant a prediction row is stamped.
pub const PREDICTION_OFFSET_SECS: i64 = 60;

/// A single observed price from the upstream quote API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

/// Indicators derived from the most recent point of one cycle's series.
///
/// A field is `None` when its window had insufficient history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub ma7: Option<f64>,
    pub ma30: Option<f64>,
    pub rsi: Option<f64>,
}

impl IndicatorSnapshot {
    /// The `{ma7, ma30, rsi}` vector, only when all three are present.
    pub fn features(&self) -> Option<IndicatorVector> {
        Some(IndicatorVector {
            ma7: self.ma7?,
            ma30: self.ma30?,
            rsi: self.rsi?,
        })
    }

    /// The ledger row for this snapshot, only when all indicators are present.
    pub fn to_ledger_record(&self) -> Option<LedgerRecord> {
        let features = self.features()?;
        Some(LedgerRecord {
            timestamp: self.timestamp,
            price: self.price,
            ma7: features.ma7,
            ma30: features.ma30,
            rsi: features.rsi,
        })
    }
}

/// Feature vector sent to the prediction service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorVector {
    #[serde(rename = "movingAverage7")]
    pub ma7: f64,
    #[serde(rename = "movingAverage30")]
    pub ma30: f64,
    pub rsi: f64,
}

/// One row of the price ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LedgerRecord {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub ma7: f64,
    pub ma30: f64,
    pub rsi: f64,
}

impl LedgerRecord {
    pub const HEADER: &'static str = "timestamp,price,movingAverage7,movingAverage30,rsi";

    /// Render as a CSV line without the trailing newline.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{:.2},{:.2},{:.2},{:.2}",
            self.timestamp.format(LEDGER_TIME_FORMAT),
            self.price,
            self.ma7,
            self.ma30,
            self.rsi
        )
    }
}

/// One row of the prediction ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub predicted_price: f64,
}

impl PredictionRecord {
    pub const HEADER: &'static str = "timestamp,prediction";

    /// Stamp a prediction one minute after `appended_at`, truncated to whole
    /// seconds.
    pub fn ahead_of(appended_at: DateTime<Utc>, predicted_price: f64) -> Self {
        let truncated = appended_at
            .duration_trunc(Duration::seconds(1))
            .unwrap_or(appended_at);
        Self {
            timestamp: truncated + Duration::seconds(PREDICTION_OFFSET_SECS),
            predicted_price,
        }
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{:.2}",
            self.timestamp.format(LEDGER_TIME_FORMAT),
            self.predicted_price
        )
    }
}

/// Where a cycle currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Computing,
    Persisting,
    Predicting,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Computing => write!(f, "Computing"),
            Self::Persisting => write!(f, "Persisting"),
            Self::Predicting => write!(f, "Predicting"),
        }
    }
}
