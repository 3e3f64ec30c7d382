// =============================================================================
// Runtime Configuration — pipeline settings from JSON + environment
// =============================================================================
//
// Every tunable of the ingestion pipeline lives here: cycle interval, tracked
// asset, ledger paths, upstream URLs and indicator periods.  Nothing is
// hardcoded in the core logic.
//
// All fields carry `#[serde(default)]` so that a partial (or empty) JSON file
// still loads.  A handful of environment variables override the file so the
// service can be pointed elsewhere without editing it.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::IndicatorPeriods;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_asset() -> String {
    "bitcoin".to_string()
}

fn default_vs_currency() -> String {
    "usd".to_string()
}

fn default_history_days() -> u32 {
    7
}

fn default_price_ledger_path() -> PathBuf {
    PathBuf::from("data/bitcoin_prices.csv")
}

fn default_prediction_ledger_path() -> PathBuf {
    PathBuf::from("public/data/predictions.csv")
}

fn default_price_api_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_prediction_service_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_retrain_every() -> u32 {
    1
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the price pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // --- Scheduling ---------------------------------------------------------

    /// Seconds between cycle ticks.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Upper bound for any single network step of a cycle.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Tracked asset ------------------------------------------------------

    /// Asset identifier understood by the quote API (e.g. "bitcoin").
    #[serde(default = "default_asset")]
    pub asset: String,

    /// Quote currency (e.g. "usd").
    #[serde(default = "default_vs_currency")]
    pub vs_currency: String,

    /// Days of history fetched each cycle.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    /// Indicator look-back periods.
    #[serde(default)]
    pub periods: IndicatorPeriods,

    // --- Ledgers ------------------------------------------------------------

    #[serde(default = "default_price_ledger_path")]
    pub price_ledger_path: PathBuf,

    #[serde(default = "default_prediction_ledger_path")]
    pub prediction_ledger_path: PathBuf,

    /// Write a CSV header line into empty ledger files.
    #[serde(default)]
    pub write_ledger_headers: bool,

    // --- External services --------------------------------------------------

    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,

    #[serde(default = "default_prediction_service_url")]
    pub prediction_service_url: String,

    /// When false the cycle stops after persisting (logging-only mode).
    #[serde(default = "default_true")]
    pub predictions_enabled: bool,

    /// Trigger a retrain after every N-th successful prediction.
    #[serde(default = "default_retrain_every")]
    pub retrain_every: u32,

    // --- HTTP surface -------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            request_timeout_secs: default_request_timeout_secs(),
            asset: default_asset(),
            vs_currency: default_vs_currency(),
            history_days: default_history_days(),
            periods: IndicatorPeriods::default(),
            price_ledger_path: default_price_ledger_path(),
            prediction_ledger_path: default_prediction_ledger_path(),
            write_ledger_headers: false,
            price_api_url: default_price_api_url(),
            prediction_service_url: default_prediction_service_url(),
            predictions_enabled: true,
            retrain_every: default_retrain_every(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            asset = %config.asset,
            interval_seconds = config.interval_seconds,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(asset) = lookup("COIN_PULSE_ASSET") {
            self.asset = asset.trim().to_lowercase();
        }
        if let Some(secs) = lookup("COIN_PULSE_INTERVAL_SECS") {
            self.interval_seconds = secs
                .trim()
                .parse()
                .with_context(|| format!("COIN_PULSE_INTERVAL_SECS is not a number: {secs}"))?;
        }
        if let Some(url) = lookup("PREDICTION_SERVICE_URL") {
            self.prediction_service_url = url.trim().to_string();
        }
        if let Some(url) = lookup("PRICE_API_URL") {
            self.price_api_url = url.trim().to_string();
        }
        if let Some(addr) = lookup("COIN_PULSE_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            bail!("interval_seconds must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if self.asset.is_empty() {
            bail!("asset must not be empty");
        }
        if self.history_days == 0 {
            bail!("history_days must be positive");
        }
        let p = self.periods;
        if p.short_ma == 0 || p.long_ma == 0 || p.rsi == 0 {
            bail!("indicator periods must be positive (got {p:?})");
        }
        if self.retrain_every == 0 {
            bail!("retrain_every must be positive");
        }
        if self.price_api_url.is_empty() || self.prediction_service_url.is_empty() {
            bail!("service URLs must not be empty");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.asset, "bitcoin");
        assert_eq!(cfg.history_days, 7);
        assert_eq!(cfg.periods.short_ma, 7);
        assert_eq!(cfg.periods.long_ma, 30);
        assert_eq!(cfg.periods.rsi, 14);
        assert!(cfg.predictions_enabled);
        assert!(!cfg.write_ledger_headers);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(15));
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.price_ledger_path, PathBuf::from("data/bitcoin_prices.csv"));
        assert_eq!(cfg.retrain_every, 1);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "interval_seconds": 10, "asset": "ethereum", "predictions_enabled": false }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.interval(), Duration::from_secs(10));
        assert_eq!(cfg.asset, "ethereum");
        assert!(!cfg.predictions_enabled);
        assert_eq!(cfg.vs_currency, "usd");
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("COIN_PULSE_ASSET", " Ethereum "),
            ("COIN_PULSE_INTERVAL_SECS", "10"),
            ("PREDICTION_SERVICE_URL", "http://model:5000"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PipelineConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.asset, "ethereum");
        assert_eq!(cfg.interval_seconds, 10);
        assert_eq!(cfg.prediction_service_url, "http://model:5000");
        assert_eq!(cfg.price_api_url, default_price_api_url());
    }

    #[test]
    fn bad_env_interval_is_an_error() {
        let mut cfg = PipelineConfig::default();
        let res = cfg.apply_env(|k| (k == "COIN_PULSE_INTERVAL_SECS").then(|| "soon".to_string()));
        assert!(res.is_err());
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut cfg = PipelineConfig::default();
        cfg.interval_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.periods.rsi = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.asset.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("failed to read pipeline config"));
    }
}
