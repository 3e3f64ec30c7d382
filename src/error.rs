// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Every variant is handled inside the cycle that produced it: logged with the
// cycle number and phase, then the cycle ends.  None of them stops the
// scheduler.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure talking to the upstream price source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("price source request failed: {0}")]
    Transport(String),
    #[error("price source returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("price source rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("price source payload malformed: {0}")]
    Malformed(String),
    #[error("price source did not answer within {0:?}")]
    Timeout(Duration),
}

/// Malformed numeric input into the indicator functions or logging endpoints.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Failure appending to a ledger file.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger write to {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure obtaining a prediction.
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction request failed: {0}")]
    Transport(String),
    #[error("prediction service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("prediction response malformed: {0}")]
    Malformed(String),
    #[error("prediction service did not answer within {0:?}")]
    Timeout(Duration),
}

/// Failure or refusal of a retrain trigger.
#[derive(Debug, Error)]
pub enum RetrainError {
    #[error("retrain request failed: {0}")]
    Transport(String),
    #[error("retrain rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("training service did not answer within {0:?}")]
    Timeout(Duration),
}

/// Umbrella error for a single ingestion cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    InvalidInput(#[from] IndicatorError),
    #[error(transparent)]
    Io(#[from] LedgerError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Retrain(#[from] RetrainError),
}

impl PipelineError {
    /// Short machine-readable kind, used in logs and the error ring.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FetchError",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Io(_) => "IOError",
            Self::Prediction(_) => "PredictionError",
            Self::Retrain(_) => "RetrainError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let e: PipelineError = FetchError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(e.kind(), "FetchError");
        let e: PipelineError = IndicatorError::InvalidInput("nan".into()).into();
        assert_eq!(e.kind(), "InvalidInput");
        let e: PipelineError = LedgerError::Io {
            path: PathBuf::from("x.csv"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
        .into();
        assert_eq!(e.kind(), "IOError");
        assert!(e.to_string().contains("x.csv"));
    }
}
