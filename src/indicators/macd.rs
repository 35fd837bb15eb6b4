// =============================================================================
// MACD — bearish divergence detection for the Position Monitor
// =============================================================================
//
// Standard 12/26/9 MACD. The Position Monitor only needs one derived boolean
// per refresh cycle: is price making a new (or near-new) high while the MACD
// histogram has been declining over the same window — a classic bearish
// divergence warning feeding the exit-rule cascade.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// MACD line + signal line + histogram, one value per bar starting once
/// both the slow EMA and the signal EMA have enough history.
pub struct MacdSeries {
    pub histogram: Vec<f64>,
}

pub fn calculate_macd(closes: &[f64]) -> Option<MacdSeries> {
    if closes.len() < 26 + 9 {
        return None;
    }
    let ema12 = calculate_ema(closes, 12);
    let ema26 = calculate_ema(closes, 26);

    // Align series: ema12 starts at index 11, ema26 at index 25 (0-based into
    // `closes`). Slice ema12 so both start at the same absolute bar.
    let offset = 26 - 12;
    if ema12.len() <= offset {
        return None;
    }
    let ema12_aligned = &ema12[offset..];
    let n = ema12_aligned.len().min(ema26.len());
    if n == 0 {
        return None;
    }
    let macd_line: Vec<f64> = (0..n).map(|i| ema12_aligned[i] - ema26[i]).collect();
    let signal_line = calculate_ema(&macd_line, 9);
    if signal_line.is_empty() {
        return None;
    }
    let sig_offset = macd_line.len() - signal_line.len();
    let histogram: Vec<f64> = signal_line
        .iter()
        .enumerate()
        .map(|(i, sig)| macd_line[i + sig_offset] - sig)
        .collect();

    Some(MacdSeries { histogram })
}

/// Bearish divergence: price sits within `near_high_pct` of its `lookback`
/// recent high, while the MACD histogram's trailing slope over `lookback`
/// bars is negative.
pub fn bearish_divergence(closes: &[f64], lookback: usize, near_high_pct: f64) -> bool {
    if closes.len() < lookback + 1 {
        return false;
    }
    let recent = &closes[closes.len() - lookback..];
    let recent_high = recent.iter().cloned().fold(f64::MIN, f64::max);
    let price = *closes.last().unwrap();
    if recent_high <= 0.0 || (recent_high - price) / recent_high * 100.0 > near_high_pct {
        return false;
    }

    let macd = match calculate_macd(closes) {
        Some(m) => m,
        None => return false,
    };
    if macd.histogram.len() < lookback {
        return false;
    }
    let window = &macd.histogram[macd.histogram.len() - lookback..];
    window.first().copied().unwrap_or(0.0) > window.last().copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        assert!(calculate_macd(&[1.0; 10]).is_none());
    }

    #[test]
    fn macd_produces_histogram_on_long_series() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let macd = calculate_macd(&closes).unwrap();
        assert!(!macd.histogram.is_empty());
    }

    #[test]
    fn no_divergence_on_monotonic_rise() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        // Strictly rising price with strictly rising MACD histogram -> no divergence.
        assert!(!bearish_divergence(&closes, 10, 2.0));
    }
}
