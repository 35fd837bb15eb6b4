// =============================================================================
// Risk Gate Cascade — mandatory checks before a buy candidate becomes a
// BuySignal
// =============================================================================
//
// Fail-fast cascade: the first failing gate wins and no further gates are
// evaluated. Each rejection is a typed `GateRejection` variant rather than a
// free-form string so callers can match on *why* a candidate was rejected.
// =============================================================================

use chrono::NaiveTime;

use crate::config::{RiskConfig, ScannerConfig};
use crate::error::GateRejection;
use crate::types::{Bar, MarketRegime, TradeTier, VixRegime};

/// Everything a gate needs to evaluate one buy candidate, gathered by the
/// caller (Signal Detector) before invoking the cascade.
pub struct GateInputs<'a> {
    pub bar_count: usize,
    pub min_bars: usize,
    pub now_kst: NaiveTime,
    pub rsi: f64,
    pub regime: MarketRegime,
    pub vix_regime: VixRegime,
    pub risk_off_level: u8,
    pub volume_ratio: f64,
    pub price: f64,
    pub vwap: f64,
    pub cooldown_remaining_secs: Option<i64>,
    pub stoploss_cooldown_active: bool,
    pub sell_cooldown_active: bool,
    pub trade_tier: TradeTier,
    pub last_two_bars: Option<(&'a Bar, &'a Bar)>,
}

fn parse_hm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

fn in_window(now: NaiveTime, start: &str, end: &str) -> bool {
    now >= parse_hm(start) && now < parse_hm(end)
}

/// Shooting-star / bearish-engulfing detection on the most recent two bars.
fn micro_timing_pattern(prev: &Bar, cur: &Bar) -> Option<&'static str> {
    let body = (cur.close - cur.open).abs();
    let range = cur.high - cur.low;
    let upper_wick = cur.high - cur.open.max(cur.close);
    if range > 0.0 && upper_wick >= body * 2.0 && upper_wick / range > 0.5 && cur.close < cur.open {
        return Some("shooting_star");
    }

    let prev_bullish = prev.close > prev.open;
    let cur_bearish = cur.close < cur.open;
    if prev_bullish && cur_bearish && cur.open >= prev.close && cur.close <= prev.open {
        return Some("bearish_engulfing");
    }

    None
}

/// Run every gate in priority order. Returns `Ok(())` only if all pass.
pub fn check(
    input: &GateInputs,
    scanner: &ScannerConfig,
    risk: &RiskConfig,
) -> Result<(), GateRejection> {
    // Gate 1: minimum completed bars.
    if input.bar_count < input.min_bars {
        return Err(GateRejection::InsufficientBars {
            have: input.bar_count,
            need: input.min_bars,
        });
    }

    // Gate 2: no-trade window (opening volatility).
    if in_window(input.now_kst, scanner.no_trade_window_start, scanner.no_trade_window_end) {
        return Err(GateRejection::NoTradeWindow);
    }

    // Gate 3: danger zone (closing volatility / program-trading window).
    if in_window(input.now_kst, scanner.danger_zone_start, scanner.danger_zone_end) {
        return Err(GateRejection::DangerZone);
    }

    // Gate 4: RSI cap, regime-dependent (wider cap in bull regimes).
    let rsi_cap = if input.regime.is_bull() {
        scanner.rsi_cap_bull
    } else {
        scanner.rsi_cap_default
    };
    if input.rsi > rsi_cap {
        return Err(GateRejection::RsiGuard { rsi: input.rsi, cap: rsi_cap });
    }

    // Gate 5: macro risk-off level / VIX crisis regime blocks all entries.
    if input.risk_off_level >= 2 || input.vix_regime == VixRegime::Crisis {
        return Err(GateRejection::MacroRiskOff {
            level: input.risk_off_level,
            vix: format!("{:?}", input.vix_regime),
        });
    }

    // Gate 6: bearish market regime blocks new entries outright.
    if input.regime.is_bearish() {
        return Err(GateRejection::MarketRegime {
            regime: input.regime.to_string(),
        });
    }

    // Gate 7: combined volume/VWAP risk — chasing an already-extended move.
    let price_over_vwap = if input.vwap > 0.0 {
        input.price / input.vwap
    } else {
        1.0
    };
    if input.volume_ratio > 2.0 && price_over_vwap > 1.02 {
        return Err(GateRejection::CombinedRisk {
            volume_ratio: input.volume_ratio,
            price_over_vwap,
        });
    }

    // Gate 8: per-code signal cooldown.
    if let Some(remaining) = input.cooldown_remaining_secs {
        if remaining > 0 {
            return Err(GateRejection::Cooldown { remaining_secs: remaining });
        }
    }

    // Gate 9: stoploss cooldown (re-entry block after a stop-loss exit).
    if input.stoploss_cooldown_active {
        return Err(GateRejection::StoplossCooldown);
    }

    // Gate 10: sell cooldown (re-entry block shortly after any sell).
    if input.sell_cooldown_active {
        return Err(GateRejection::SellCooldown);
    }

    // Gate 11: trade tier blocked by the watchlist scorer.
    if input.trade_tier == TradeTier::Blocked {
        return Err(GateRejection::TradeTierBlocked);
    }

    // Gate 12: micro-timing — don't buy into a shooting star / bearish
    // engulfing candle even if everything upstream says go.
    if let Some((prev, cur)) = input.last_two_bars {
        if let Some(pattern) = micro_timing_pattern(prev, cur) {
            return Err(GateRejection::MicroTiming {
                pattern: pattern.to_string(),
            });
        }
    }

    let _ = risk;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            code: "005930".to_string(),
            bar_start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    fn base_input<'a>(last_two: Option<(&'a Bar, &'a Bar)>) -> GateInputs<'a> {
        GateInputs {
            bar_count: 30,
            min_bars: 20,
            now_kst: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            rsi: 60.0,
            regime: MarketRegime::Bull,
            vix_regime: VixRegime::Normal,
            risk_off_level: 0,
            volume_ratio: 1.5,
            price: 70_000.0,
            vwap: 69_800.0,
            cooldown_remaining_secs: None,
            stoploss_cooldown_active: false,
            sell_cooldown_active: false,
            trade_tier: TradeTier::Tier1,
            last_two_bars: last_two,
        }
    }

    #[test]
    fn all_gates_pass_on_healthy_candidate() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        assert!(check(&base_input(None), &scanner, &risk).is_ok());
    }

    #[test]
    fn insufficient_bars_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.bar_count = 5;
        assert!(matches!(
            check(&input, &scanner, &risk),
            Err(GateRejection::InsufficientBars { .. })
        ));
    }

    #[test]
    fn no_trade_window_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.now_kst = NaiveTime::from_hms_opt(9, 5, 0).unwrap();
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::NoTradeWindow)));
    }

    #[test]
    fn danger_zone_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.now_kst = NaiveTime::from_hms_opt(14, 30, 0).unwrap();
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::DangerZone)));
    }

    #[test]
    fn rsi_over_cap_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.rsi = 90.0;
        input.regime = MarketRegime::Sideways;
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::RsiGuard { .. })));
    }

    #[test]
    fn bull_regime_widens_rsi_cap() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.rsi = 80.0;
        input.regime = MarketRegime::Bull;
        assert!(check(&input, &scanner, &risk).is_ok());
    }

    #[test]
    fn bearish_regime_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.regime = MarketRegime::Bear;
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::MarketRegime { .. })));
    }

    #[test]
    fn macro_risk_off_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.risk_off_level = 2;
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::MacroRiskOff { .. })));
    }

    #[test]
    fn trade_tier_blocked_rejects() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let mut input = base_input(None);
        input.trade_tier = TradeTier::Blocked;
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::TradeTierBlocked)));
    }

    #[test]
    fn shooting_star_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let prev = bar(100.0, 102.0, 99.0, 101.0);
        let cur = bar(101.0, 110.0, 100.5, 101.2);
        let input = base_input(Some((&prev, &cur)));
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::MicroTiming { .. })));
    }

    #[test]
    fn bearish_engulfing_blocks() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let prev = bar(100.0, 103.0, 99.5, 102.0);
        let cur = bar(102.5, 103.0, 98.0, 99.0);
        let input = base_input(Some((&prev, &cur)));
        assert!(matches!(check(&input, &scanner, &risk), Err(GateRejection::MicroTiming { .. })));
    }

    #[test]
    fn normal_candle_passes_micro_timing() {
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let prev = bar(100.0, 101.0, 99.5, 100.5);
        let cur = bar(100.5, 101.5, 100.0, 101.2);
        let input = base_input(Some((&prev, &cur)));
        assert!(check(&input, &scanner, &risk).is_ok());
    }
}
