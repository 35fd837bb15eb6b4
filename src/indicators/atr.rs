// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures market volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::types::DailyCandle;

/// Compute the most recent ATR value from a slice of daily OHLCV candles
/// using Wilder's smoothing method.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` candles (we need `period` TR values,
///   each requiring a previous candle for the True Range calculation).
/// - Any intermediate value is non-finite.
pub fn calculate_atr(candles: &[DailyCandle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    if atr.is_finite() {
        Some(atr)
    } else {
        None
    }
}

/// Calculate ATR as a percentage of the current price.
pub fn calculate_atr_pct(candles: &[DailyCandle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

/// ATR clamped to `[1%, 5%]` of `price`, used by the Buy Executor's sizing
/// step and the Position Monitor's trailing-stop computation. Falls back
/// to 2% of `price` when ATR cannot be
/// computed from the supplied history.
pub fn clamped_atr(candles: &[DailyCandle], period: usize, price: f64) -> f64 {
    let raw = calculate_atr(candles, period).unwrap_or(price * 0.02);
    raw.clamp(price * 0.01, price * 0.05)
}

/// Convenience function: compute ATR with the standard 14-period default.
pub fn calculate(candles: &[DailyCandle]) -> Option<f64> {
    calculate_atr(candles, 14)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> DailyCandle {
        DailyCandle {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn atr_period_zero() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            candles.push(candle(base, base + 5.0, base - 5.0, base));
        }
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn clamped_atr_respects_upper_bound() {
        // Huge range relative to price -> clamp to 5%.
        let candles: Vec<DailyCandle> = (0..20)
            .map(|_| candle(10_000.0, 12_000.0, 8_000.0, 10_000.0))
            .collect();
        let atr = clamped_atr(&candles, 14, 10_000.0);
        assert!(atr <= 500.0 + 1e-6, "expected clamp to 5% of price, got {atr}");
    }

    #[test]
    fn clamped_atr_falls_back_on_insufficient_history() {
        let candles = vec![candle(10_000.0, 10_100.0, 9_900.0, 10_000.0); 3];
        let atr = clamped_atr(&candles, 14, 10_000.0);
        assert!((atr - 200.0).abs() < 1e-6, "expected 2% fallback, got {atr}");
    }
}
