// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator functions plus the snapshot builder used
// once per ingestion cycle.  Nothing in here performs I/O or keeps state.

pub mod rsi;
pub mod sma;

use serde::{Deserialize, Serialize};

use crate::error::IndicatorError;
use crate::types::{IndicatorSnapshot, PricePoint};

pub use rsi::calculate_rsi;
pub use sma::calculate_moving_average;

/// Look-back periods for the three indicators the pipeline logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorPeriods {
    pub short_ma: usize,
    pub long_ma: usize,
    pub rsi: usize,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            short_ma: 7,
            long_ma: 30,
            rsi: rsi::DEFAULT_RSI_PERIOD,
        }
    }
}

/// Shared argument check: positive period, finite prices.
pub(crate) fn validate(prices: &[f64], period: usize) -> Result<(), IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidInput(
            "period must be a positive integer".to_string(),
        ));
    }
    if let Some((idx, bad)) = prices.iter().enumerate().find(|(_, p)| !p.is_finite()) {
        return Err(IndicatorError::InvalidInput(format!(
            "non-finite price {bad} at index {idx}"
        )));
    }
    Ok(())
}

/// Sort `series` by timestamp and derive the snapshot for its latest point.
///
/// The sort is stable, so points sharing a timestamp keep their arrival
/// order.  Returns `Ok(None)` for an empty series.
pub fn snapshot_latest(
    series: &mut [PricePoint],
    periods: IndicatorPeriods,
) -> Result<Option<IndicatorSnapshot>, IndicatorError> {
    series.sort_by_key(|p| p.timestamp);
    let Some(latest) = series.last().copied() else {
        return Ok(None);
    };

    let prices: Vec<f64> = series.iter().map(|p| p.price).collect();
    let ma7 = calculate_moving_average(&prices, periods.short_ma)?;
    let ma30 = calculate_moving_average(&prices, periods.long_ma)?;
    let rsi = calculate_rsi(&prices, periods.rsi)?;

    Ok(Some(IndicatorSnapshot {
        timestamp: latest.timestamp,
        price: latest.price,
        ma7: ma7.last().copied(),
        ma30: ma30.last().copied(),
        rsi: rsi.last().copied(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn hourly(prices: &[f64]) -> Vec<PricePoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &p)| PricePoint::new(start + Duration::hours(i as i64), p))
            .collect()
    }

    #[test]
    fn snapshot_of_empty_series_is_none() {
        assert!(snapshot_latest(&mut [], IndicatorPeriods::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn snapshot_marks_short_windows_absent() {
        let prices: Vec<f64> = (0..20).map(|x| 100.0 + x as f64).collect();
        let snap = snapshot_latest(&mut hourly(&prices), IndicatorPeriods::default())
            .unwrap()
            .unwrap();
        assert_eq!(snap.price, 119.0);
        assert!(snap.ma7.is_some());
        assert!(snap.ma30.is_none());
        assert!(snap.rsi.is_some());
    }

    #[test]
    fn snapshot_takes_latest_after_sorting() {
        let prices: Vec<f64> = (0..40).map(|x| x as f64).collect();
        let mut series = hourly(&prices);
        series.reverse();
        let snap = snapshot_latest(&mut series, IndicatorPeriods::default())
            .unwrap()
            .unwrap();
        assert_eq!(snap.price, 39.0);
        // Mean of the 7 prices before index 39: 32..=38.
        assert_eq!(snap.ma7, Some(35.0));
        // Mean of 9..=38.
        assert_eq!(snap.ma30, Some(23.5));
        assert_eq!(snap.rsi, Some(100.0));
    }

    #[test]
    fn duplicate_timestamps_keep_arrival_order() {
        let mut series = hourly(&[1.0, 2.0, 3.0]);
        let dup = PricePoint::new(series[2].timestamp, 4.0);
        series.push(dup);
        let snap = snapshot_latest(&mut series, IndicatorPeriods::default())
            .unwrap()
            .unwrap();
        assert_eq!(snap.price, 4.0);
        assert_eq!(series[2].price, 3.0);
    }

    #[test]
    fn snapshot_propagates_invalid_input() {
        let mut series = hourly(&[1.0, f64::INFINITY, 3.0]);
        assert!(snapshot_latest(&mut series, IndicatorPeriods::default()).is_err());
    }
}
