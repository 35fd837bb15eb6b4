// =============================================================================
// Correlation Guard — Pearson correlation of log-returns between candidates
// =============================================================================
//
// Before sizing a new buy, compare the candidate's
// ~60-day log-return series against every currently held stock; if any pair
// correlates above `max_corr` the buy is blocked outright (concentration
// risk masquerading as diversification). Follows the repo's plain
// numeric-helper style (`indicators/*`: pure functions over `&[f64]`, `Option`
// for
// insufficient data).
// =============================================================================

use crate::types::DailyCandle;

/// Minimum number of overlapping, finite log-return samples required before
/// a correlation is trusted at all — below this a Pearson coefficient is
/// statistical noise, not a signal worth blocking a buy on.
const MIN_PERIODS: usize = 20;

/// Log-returns derived from a daily candle series, oldest-first. Non-finite
/// samples (zero/negative close on either side of the pair) are excluded
/// rather than propagated as NaN/inf.
pub fn log_returns(candles: &[DailyCandle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter_map(|w| {
            if w[0].close > 0.0 && w[1].close > 0.0 {
                let r = (w[1].close / w[0].close).ln();
                if r.is_finite() {
                    Some(r)
                } else {
                    None
                }
            } else {
                None
            }
        })
        .collect()
}

/// Pearson correlation coefficient between two equal-length series. `None`
/// if the series differ in length, fall short of `MIN_PERIODS` finite
/// samples, or either has zero variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len();
    if n < MIN_PERIODS || n != b.len() {
        return None;
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return None;
    }
    let n_f = n as f64;
    let mean_a = a.iter().sum::<f64>() / n_f;
    let mean_b = b.iter().sum::<f64>() / n_f;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    let corr = cov / (var_a.sqrt() * var_b.sqrt());
    if corr.is_finite() {
        Some(corr)
    } else {
        None
    }
}

/// Correlation between two raw daily-candle histories, aligned on their
/// common trailing window (the shorter of the two series' length).
pub fn correlation_of_candles(a: &[DailyCandle], b: &[DailyCandle]) -> Option<f64> {
    let ra = log_returns(a);
    let rb = log_returns(b);
    let n = ra.len().min(rb.len());
    if n < MIN_PERIODS {
        return None;
    }
    pearson(&ra[ra.len() - n..], &rb[rb.len() - n..])
}

/// Highest *positive* correlation of `candidate` against any of `held`,
/// together with the held code it correlates most with. Negative
/// correlations are diversifying, not a concentration risk, so they never
/// win here — this only ever returns `Some` when some held stock moves with
/// the candidate, matching the "highest same-direction correlation" rule the
/// block threshold is checked against.
pub fn max_correlation<'a>(
    candidate: &[DailyCandle],
    held: impl Iterator<Item = (&'a str, &'a [DailyCandle])>,
) -> Option<(&'a str, f64)> {
    held
        .filter_map(|(code, candles)| correlation_of_candles(candidate, candles).map(|c| (code, c)))
        .filter(|(_, c)| *c > 0.0)
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn candle(close: f64) -> DailyCandle {
        DailyCandle {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        }
    }

    fn series(closes: &[f64]) -> Vec<DailyCandle> {
        closes.iter().map(|&c| candle(c)).collect()
    }

    /// Repeats a short oscillation out to `len` closes — comfortably over
    /// `MIN_PERIODS` worth of log-returns while keeping the correlation sign
    /// and strength from the base pattern.
    fn oscillating(base_up: f64, base_down: f64, len: usize) -> Vec<f64> {
        (0..len).map(|i| if i % 2 == 0 { base_up } else { base_down }).collect()
    }

    #[test]
    fn identical_series_are_perfectly_correlated() {
        let a = series(&oscillating(100.0, 105.0, 25));
        let corr = correlation_of_candles(&a, &a).unwrap();
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inverse_series_are_perfectly_anti_correlated() {
        let a = series(&oscillating(100.0, 110.0, 25));
        let b = series(&oscillating(100.0, 90.0, 25));
        let corr = correlation_of_candles(&a, &b).unwrap();
        assert!(corr < -0.9, "expected strong negative correlation, got {corr}");
    }

    #[test]
    fn negative_correlation_never_wins_max_correlation() {
        let candidate = series(&oscillating(100.0, 110.0, 25));
        let anti = series(&oscillating(100.0, 90.0, 25)); // strong negative corr
        let held: Vec<(&str, &[DailyCandle])> = vec![("AAA", anti.as_slice())];
        assert!(max_correlation(&candidate, held.into_iter()).is_none());
    }

    #[test]
    fn insufficient_data_yields_none() {
        let a = series(&[100.0]);
        let b = series(&[100.0, 101.0]);
        assert!(correlation_of_candles(&a, &b).is_none());
    }

    #[test]
    fn fewer_than_min_periods_yields_none_even_with_perfect_correlation() {
        // 6 closes -> 5 overlapping log-return pairs, well under MIN_PERIODS
        // (20). A naive pearson() over such a short window would report a
        // perfect 1.0 correlation here; the min-periods floor must reject it.
        let a = series(&[100.0, 102.0, 101.0, 105.0, 103.0, 108.0]);
        assert!(correlation_of_candles(&a, &a).is_none());
        assert!(pearson(&log_returns(&a), &log_returns(&a)).is_none());
    }

    #[test]
    fn max_correlation_picks_highest_positive_and_ignores_anti_correlated() {
        let candidate = series(&oscillating(100.0, 110.0, 25));
        let held_a = series(&oscillating(50.0, 55.0, 25)); // strong positive corr
        let held_b = series(&oscillating(100.0, 90.0, 25)); // strong anti-corr
        let held: Vec<(&str, &[DailyCandle])> =
            vec![("AAA", held_a.as_slice()), ("BBB", held_b.as_slice())];
        let (code, corr) = max_correlation(&candidate, held.into_iter()).unwrap();
        assert_eq!(code, "AAA");
        assert!(corr > 0.9);
    }
}
