// =============================================================================
// Simple Moving Average — MA5 / MA20 cross detection and death-cross
// =============================================================================
//
// Golden Cross / Death Cross detection compares a short SMA against a longer
// one across the last two completed bars. Unlike `indicators::ema`, no
// smoothing carries across calls — each call is a pure function of the
// supplied close slice, matching the Bar Engine's "recompute from the
// capped bar sequence" model.
// =============================================================================

/// Simple moving average of the last `period` values in `closes`.
/// `None` if there are fewer than `period` values.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sum: f64 = window.iter().sum();
    Some(sum / period as f64)
}

/// Whether the `short`-period SMA crossed above the `long`-period SMA
/// between the previous completed bar and the current one.
///
/// Requires at least `long + 1` closes (one extra bar to detect the cross).
pub fn crossed_above(closes: &[f64], short: usize, long: usize) -> bool {
    if closes.len() < long + 1 {
        return false;
    }
    let prev = &closes[..closes.len() - 1];
    let (prev_short, prev_long) = match (sma(prev, short), sma(prev, long)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    let (cur_short, cur_long) = match (sma(closes, short), sma(closes, long)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    prev_short <= prev_long && cur_short > cur_long
}

/// Whether the `short`-period SMA crossed *below* the `long`-period SMA,
/// by more than `margin_pct` of the long SMA — used for the Position
/// Monitor's death-cross flag.
pub fn crossed_below_by(closes: &[f64], short: usize, long: usize, margin_pct: f64) -> bool {
    if closes.len() < long + 1 {
        return false;
    }
    let prev = &closes[..closes.len() - 1];
    let (prev_short, prev_long) = match (sma(prev, short), sma(prev, long)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    let (cur_short, cur_long) = match (sma(closes, short), sma(closes, long)) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    if cur_long == 0.0 {
        return false;
    }
    let was_above = prev_short >= prev_long;
    let gap_pct = (cur_long - cur_short) / cur_long * 100.0;
    was_above && cur_short < cur_long && gap_pct > margin_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_insufficient_data() {
        assert_eq!(sma(&[1.0, 2.0], 5), None);
    }

    #[test]
    fn sma_basic() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 5), Some(3.0));
    }

    #[test]
    fn golden_cross_detected() {
        // MA5 sits at/below MA20 then pops above on the final bar.
        let mut closes = vec![100.0; 20];
        closes.push(96.0); // MA5 still below MA20 after this dip-ish bar
        closes.push(96.0);
        closes.push(96.0);
        closes.push(96.0);
        closes.push(115.0); // sharp pop
        assert!(crossed_above(&closes, 5, 20));
    }

    #[test]
    fn golden_cross_not_detected_on_flat_series() {
        let closes = vec![100.0; 25];
        assert!(!crossed_above(&closes, 5, 20));
    }

    #[test]
    fn death_cross_requires_margin() {
        let mut closes = vec![100.0; 20];
        closes.extend([100.0, 100.0, 100.0, 100.0, 99.9]); // tiny dip, under margin
        assert!(!crossed_below_by(&closes, 5, 20, 0.2));
    }
}
