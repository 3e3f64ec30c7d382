// =============================================================================
// Simple Moving Average (SMA) — trailing window
// =============================================================================
//
// For every index `i >= period` the output holds the arithmetic mean of the
// `period` prices strictly before `i`:
//
//   SMA_i = (p[i - period] + ... + p[i - 1]) / period
//
// The window never includes `p[i]` itself, so `n` prices give `n - period`
// values.  A running sum keeps the whole pass O(n).
// =============================================================================

use crate::error::IndicatorError;
use crate::indicators::validate;

/// Compute the trailing SMA series for `prices` and `period`.
///
/// # Errors
/// `InvalidInput` when `period == 0` or any price is non-finite.
pub fn calculate_moving_average(
    prices: &[f64],
    period: usize,
) -> Result<Vec<f64>, IndicatorError> {
    validate(prices, period)?;
    if prices.len() <= period {
        return Ok(Vec::new());
    }

    let period_f = period as f64;
    let mut window_sum: f64 = prices[..period].iter().sum();
    let mut result = Vec::with_capacity(prices.len() - period);

    for i in period..prices.len() {
        result.push(window_sum / period_f);
        window_sum += prices[i] - prices[i - period];
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_known_values() {
        let ma = calculate_moving_average(&[10.0, 20.0, 30.0, 40.0], 2).unwrap();
        assert_eq!(ma, vec![15.0, 25.0]);
    }

    #[test]
    fn sma_window_excludes_current_price() {
        let ma = calculate_moving_average(&[1.0, 2.0, 3.0, 100.0], 3).unwrap();
        assert_eq!(ma, vec![2.0]);
    }

    #[test]
    fn sma_length_law() {
        let prices: Vec<f64> = (0..50).map(|x| x as f64 * 1.5).collect();
        for period in 1..60 {
            let ma = calculate_moving_average(&prices, period).unwrap();
            assert_eq!(ma.len(), prices.len().saturating_sub(period), "period {period}");
        }
    }

    #[test]
    fn sma_short_input_is_empty() {
        assert!(calculate_moving_average(&[], 7).unwrap().is_empty());
        assert!(calculate_moving_average(&[1.0, 2.0, 3.0], 7).unwrap().is_empty());
        assert!(calculate_moving_average(&[1.0; 7], 7).unwrap().is_empty());
    }

    #[test]
    fn sma_matches_naive_mean() {
        let prices = vec![3.1, 4.1, 5.9, 2.6, 5.3, 5.8, 9.7, 9.3, 2.3, 8.4, 6.2, 6.4];
        let ma = calculate_moving_average(&prices, 4).unwrap();
        for (k, value) in ma.iter().enumerate() {
            let i = k + 4;
            let naive = prices[i - 4..i].iter().sum::<f64>() / 4.0;
            assert!((value - naive).abs() < 1e-9, "index {i}: {value} vs {naive}");
        }
    }

    #[test]
    fn sma_rejects_bad_input() {
        assert!(calculate_moving_average(&[1.0, 2.0], 0).is_err());
        assert_eq!(
            calculate_moving_average(&[1.0, f64::NAN, 3.0], 1),
            Err(IndicatorError::InvalidInput(
                "non-finite price NaN at index 1".to_string()
            ))
        );
    }
}
