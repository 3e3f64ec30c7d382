// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive prices.
// Step 2 — Seed average gain / average loss with the mean of the first
//          `period` gains / losses.
// Step 3 — For every later delta apply Wilder's smoothing and emit one value:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// The seed window itself emits nothing, so `n` prices give `n - period - 1`
// values.
// =============================================================================

use crate::error::IndicatorError;
use crate::indicators::validate;

/// Default look-back used when none is configured.
pub const DEFAULT_RSI_PERIOD: usize = 14;

/// Compute the RSI series for `prices` and `period`.
///
/// # Edge cases
/// - `prices.len() <= period + 1` => empty vec
/// - Average loss of zero with gains => 100.0; no movement at all => 50.0.
///
/// # Errors
/// `InvalidInput` when `period == 0` or any price is non-finite.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Result<Vec<f64>, IndicatorError> {
    validate(prices, period)?;
    if prices.len() <= period + 1 {
        return Ok(Vec::new());
    }

    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l + d.abs())
        }
    });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period);
    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        result.push(rsi_from_averages(avg_gain, avg_loss)?);
    }

    Ok(result)
}

/// OVERBOUGHT at or above 70, OVERSOLD at or below 30.
pub fn label(value: f64) -> &'static str {
    if value >= 70.0 {
        "OVERBOUGHT"
    } else if value <= 30.0 {
        "OVERSOLD"
    } else {
        "NEUTRAL"
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Result<f64, IndicatorError> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    // Finite inputs keep the averages finite unless the deltas overflow.
    if rsi.is_finite() {
        Ok(rsi.clamp(0.0, 100.0))
    } else {
        Err(IndicatorError::InvalidInput(format!(
            "RSI overflowed (avg_gain={avg_gain}, avg_loss={avg_loss})"
        )))
    }
}
