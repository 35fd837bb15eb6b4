// =============================================================================
// Signal Detector — risk-gate cascade + priority-ordered strategy detectors
// =============================================================================
//
// Follows a gather-indicators -> gate -> score -> emit pipeline shape, with
// a conviction-override path plus six named, priority-ordered detectors. The
// gate cascade itself lives in `gates.rs`; this module wires it together with
// the Bar Engine and daily-candle history and decides which (if any) signal
// fires.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bar_engine::BarEngine;
use crate::config::{RiskConfig, ScannerConfig};
use crate::error::GateRejection;
use crate::gates::{self, GateInputs};
use crate::indicators::{rsi, sma};
use crate::types::{Bar, BuySignal, DailyCandle, MarketRegime, TradingContext, WatchlistEntry};

/// Everything the detector needs about one candidate beyond the bar engine
/// itself, gathered by the caller from the watchlist/trading-context cache
/// and per-code cooldown state.
pub struct DetectionInputs<'a> {
    pub watchlist: &'a WatchlistEntry,
    pub context: &'a TradingContext,
    pub daily_candles: &'a [DailyCandle],
    pub cooldown_remaining_secs: Option<i64>,
    pub stoploss_cooldown_active: bool,
    pub sell_cooldown_active: bool,
    pub now: DateTime<Utc>,
    pub now_kst: NaiveTime,
}

/// Outcome of one detection pass: either a fully-formed signal to publish, or
/// the reason nothing fired.
#[derive(Debug)]
pub enum DetectionOutcome {
    Signal(BuySignal),
    GateRejected(GateRejection),
    NoStrategyMatch,
}

/// A momentum candidate awaiting confirmation on the next completed bar: the
/// signal is only published if price hasn't fallen below the price observed
/// when the candidate first qualified.
#[derive(Debug, Clone)]
struct PendingMomentum {
    signal_type: &'static str,
    signal_price: f64,
    bars_remaining: u32,
}

/// Per-code holding area for momentum candidates awaiting confirmation. One
/// instance is shared across every call to [`detect`] for a given process —
/// mirrors the "pending map" the spec describes as in-memory Signal Detector
/// state, not a cache artifact.
#[derive(Default)]
pub struct MomentumConfirmations {
    pending: Mutex<HashMap<String, PendingMomentum>>,
}

impl MomentumConfirmations {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run the full detection pipeline for one code against its current bar
/// state. Returns `NoStrategyMatch` when every gate passes but no strategy's
/// pattern is present on the current bar set.
pub fn detect(
    bar_engine: &BarEngine,
    input: &DetectionInputs,
    scanner: &ScannerConfig,
    risk: &RiskConfig,
    pending: &MomentumConfirmations,
) -> DetectionOutcome {
    let code = &input.watchlist.code;
    let closed_bars = bar_engine.recent_bars(code, 60);
    let bar_count = bar_engine.bar_count(code);
    let price = match bar_engine.current_price(code) {
        Some(p) if p > 0.0 => p,
        _ => return DetectionOutcome::NoStrategyMatch,
    };
    let vwap = bar_engine.vwap(code).unwrap_or(price);
    let volume_ratio = bar_engine.volume_info(code).map(|v| v.ratio).unwrap_or(0.0);

    let closes: Vec<f64> = closed_bars.iter().map(|b| b.close).collect();
    let rsi_value = rsi::current_rsi(&closes, 14).map(|(v, _)| v).unwrap_or(50.0);

    let last_two = last_two_bars(&closed_bars);
    let gate_input = build_gate_input(
        bar_count,
        scanner.min_bars,
        input,
        rsi_value,
        volume_ratio,
        price,
        vwap,
        last_two.as_ref(),
    );
    if let Err(rejection) = gates::check(&gate_input, scanner, risk) {
        // A previously-pending momentum candidate whose gates now fail is
        // stale; drop it rather than let it resurface once gates reopen.
        pending.pending.lock().remove(code);
        return DetectionOutcome::GateRejected(rejection);
    }

    // ── Conviction override: bypasses the strategy cascade, not the gates ──
    if is_conviction_candidate(input, scanner, price, vwap, rsi_value) {
        let signal = build_signal(input, "WATCHLIST_CONVICTION", price, rsi_value, volume_ratio, vwap);
        info!(code = %code, "conviction override fired");
        return DetectionOutcome::Signal(signal);
    }

    // ── Confirmation buffer: a pending momentum candidate from a prior bar ──
    if let Some(outcome) = check_pending(pending, code, price) {
        return match outcome {
            Some(signal_type) => {
                let signal = build_signal(input, signal_type, price, rsi_value, volume_ratio, vwap);
                debug!(code = %code, signal_type, "confirmed momentum signal fired");
                DetectionOutcome::Signal(signal)
            }
            None => DetectionOutcome::NoStrategyMatch,
        };
    }

    match pick_strategy(&closes, &closed_bars, rsi_value, volume_ratio, price, vwap, input) {
        Some(candidate) if candidate.needs_confirmation => {
            pending.pending.lock().insert(
                code.clone(),
                PendingMomentum {
                    signal_type: candidate.signal_type,
                    signal_price: price,
                    bars_remaining: scanner.momentum_confirmation_bars,
                },
            );
            DetectionOutcome::NoStrategyMatch
        }
        Some(candidate) => {
            let signal = build_signal(input, candidate.signal_type, price, rsi_value, volume_ratio, vwap);
            debug!(code = %code, signal_type = candidate.signal_type, "strategy signal fired");
            DetectionOutcome::Signal(signal)
        }
        None => DetectionOutcome::NoStrategyMatch,
    }
}

/// Check whether `code` has a pending momentum candidate. Returns `None` if
/// there is no pending entry (caller should run the strategy cascade as
/// usual); `Some(Some(signal_type))` if the entry confirms this bar;
/// `Some(None)` if it is dropped (expired or invalidated) with no signal.
fn check_pending(pending: &MomentumConfirmations, code: &str, price: f64) -> Option<Option<&'static str>> {
    let mut map = pending.pending.lock();
    let entry = map.get(code)?.clone();

    if price < entry.signal_price {
        map.remove(code);
        return Some(None);
    }
    if entry.bars_remaining <= 1 {
        map.remove(code);
        return Some(Some(entry.signal_type));
    }
    map.insert(
        code.to_string(),
        PendingMomentum {
            bars_remaining: entry.bars_remaining - 1,
            ..entry
        },
    );
    Some(None)
}

fn last_two_bars(bars: &[Bar]) -> Option<(Bar, Bar)> {
    if bars.len() < 2 {
        return None;
    }
    let n = bars.len();
    Some((bars[n - 2].clone(), bars[n - 1].clone()))
}

fn build_gate_input<'a>(
    bar_count: usize,
    min_bars: usize,
    input: &DetectionInputs,
    rsi_value: f64,
    volume_ratio: f64,
    price: f64,
    vwap: f64,
    last_two: Option<&'a (Bar, Bar)>,
) -> GateInputs<'a> {
    GateInputs {
        bar_count,
        min_bars,
        now_kst: input.now_kst,
        rsi: rsi_value,
        regime: input.context.market_regime,
        vix_regime: input.context.vix_regime,
        risk_off_level: input.context.risk_off_level,
        volume_ratio,
        price,
        vwap,
        cooldown_remaining_secs: input.cooldown_remaining_secs,
        stoploss_cooldown_active: input.stoploss_cooldown_active,
        sell_cooldown_active: input.sell_cooldown_active,
        trade_tier: input.watchlist.trade_tier,
        last_two_bars: last_two.map(|(a, b)| (a, b)),
    }
}

/// Conviction entries bypass the strategy cascade: a high-scoring watchlist
/// entry discovered early in the session, not yet run up too far, enters
/// directly off the gate cascade. Requires every one of:
/// regime not bearish, SIDEWAYS additionally requiring hybrid_score >= 75,
/// watchlist age <= 2 days, hybrid OR llm score over threshold, inside the
/// conviction window, intraday gain under the cap, price within +/-1.5% of
/// VWAP, RSI under 65.
fn is_conviction_candidate(
    input: &DetectionInputs,
    scanner: &ScannerConfig,
    price: f64,
    vwap: f64,
    rsi_value: f64,
) -> bool {
    if input.context.market_regime.is_bearish() {
        return false;
    }
    if input.context.market_regime == MarketRegime::Sideways && input.watchlist.hybrid_score < 75.0 {
        return false;
    }
    if input.watchlist.age_days(input.now) > scanner.conviction_max_age_days {
        return false;
    }
    if input.watchlist.hybrid_score < scanner.conviction_min_hybrid && input.watchlist.llm_score < scanner.conviction_min_llm {
        return false;
    }
    if !in_window(input.now_kst, scanner.conviction_window_start, scanner.conviction_window_end) {
        return false;
    }
    if rsi_value >= scanner.conviction_rsi_max {
        return false;
    }
    if vwap > 0.0 {
        let vwap_dev_pct = (price - vwap).abs() / vwap * 100.0;
        if vwap_dev_pct > scanner.conviction_vwap_band_pct {
            return false;
        }
    }

    let opening_price = input.daily_candles.last().map(|c| c.open).filter(|&o| o > 0.0);
    match opening_price {
        Some(open) => {
            let gain_pct = (price - open) / open * 100.0;
            gain_pct < scanner.conviction_max_gain_pct
        }
        None => true,
    }
}

fn in_window(now: NaiveTime, start: &str, end: &str) -> bool {
    let parse = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    now >= parse(start) && now < parse(end)
}

/// An un-emitted strategy hit: either ready to publish immediately, or a
/// momentum-family candidate that must first survive the confirmation
/// buffer.
struct StrategyHit {
    signal_type: &'static str,
    needs_confirmation: bool,
}

fn hit(signal_type: &'static str) -> Option<StrategyHit> {
    Some(StrategyHit { signal_type, needs_confirmation: false })
}

fn hit_pending(signal_type: &'static str) -> Option<StrategyHit> {
    Some(StrategyHit { signal_type, needs_confirmation: true })
}

/// Percentage return of the close `bars_back` bars ago to the latest close.
fn n_bar_return_pct(closes: &[f64], bars_back: usize) -> Option<f64> {
    if closes.len() <= bars_back {
        return None;
    }
    let from = closes[closes.len() - 1 - bars_back];
    let to = *closes.last()?;
    if from <= 0.0 {
        return None;
    }
    Some((to - from) / from * 100.0)
}

/// Percentage drop of the current close from the highest high over the last
/// `bars_back` completed bars (negative when below the high).
fn dip_from_n_bar_high_pct(bars: &[Bar], bars_back: usize) -> Option<f64> {
    if bars.len() < bars_back {
        return None;
    }
    let window = &bars[bars.len() - bars_back..];
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let close = bars.last()?.close;
    if high <= 0.0 {
        return None;
    }
    Some((close - high) / high * 100.0)
}

/// Evaluate the named detectors in strict priority order, returning the
/// first that matches.
#[allow(clippy::too_many_arguments)]
fn pick_strategy(
    closes: &[f64],
    closed_bars: &[Bar],
    rsi_value: f64,
    volume_ratio: f64,
    price: f64,
    vwap: f64,
    input: &DetectionInputs,
) -> Option<StrategyHit> {
    let regime = input.context.market_regime;
    let watchlist_age = input.watchlist.age_days(input.now);

    // ── Bull-only detectors ──────────────────────────────────────────────
    if regime.is_bull() {
        // 1. Golden Cross: MA5 crosses above MA20 with volume confirmation.
        if sma::crossed_above(closes, 5, 20) && volume_ratio >= 1.5 {
            return hit("GOLDEN_CROSS");
        }

        // 2. Momentum Continuation: established uptrend, 2-5% 5-bar return,
        //    and strong LLM conviction.
        if let (Some(ma5), Some(ma20)) = (sma::sma(closes, 5), sma::sma(closes, 20)) {
            if ma5 > ma20 {
                if let Some(ret) = n_bar_return_pct(closes, 5) {
                    if (2.0..=5.0).contains(&ret) && input.watchlist.llm_score >= 65.0 {
                        return hit_pending("MOMENTUM_CONTINUATION");
                    }
                }
            }
        }
    }

    // ── General detectors ────────────────────────────────────────────────
    // 3. Momentum: 5-bar open-to-close return in [1.5%, 7%].
    if let Some(ret) = n_bar_return_pct(closes, 5) {
        if (1.5..=7.0).contains(&ret) {
            return hit_pending("MOMENTUM");
        }
    }

    // 4. Dip Buy: watchlist age 1-5 days, shallow pullback off the 5-bar
    //    high; the acceptable dip band widens outside bull regimes.
    if (1..=5).contains(&watchlist_age) {
        if let Some(dip) = dip_from_n_bar_high_pct(closed_bars, 5) {
            let band = if regime.is_bull() { -5.0..=-0.5 } else { -8.0..=-0.5 };
            if band.contains(&dip) {
                return hit("DIP_BUY");
            }
        }
    }

    // ── Counter-trend (non-bull only) ────────────────────────────────────
    if !regime.is_bull() {
        let threshold = rsi_rebound_threshold(regime);
        let series = rsi::calculate_rsi(closes, 14);
        if series.len() >= 2 {
            let prev = series[series.len() - 2];
            let cur = series[series.len() - 1];
            if prev < threshold && cur >= threshold {
                return hit("RSI_REBOUND");
            }
        }
        let _ = rsi_value;
    }

    // ── Volume breakout (always eligible) ────────────────────────────────
    if volume_ratio >= 3.0 && closed_bars.len() >= 20 {
        let prior_high = closed_bars[closed_bars.len() - 20..]
            .iter()
            .map(|b| b.high)
            .fold(f64::MIN, f64::max);
        if price > prior_high {
            return hit("VOLUME_BREAKOUT");
        }
    }

    let _ = vwap;
    None
}

fn rsi_rebound_threshold(regime: MarketRegime) -> f64 {
    match regime {
        MarketRegime::Sideways => 40.0,
        MarketRegime::Bear => 30.0,
        MarketRegime::StrongBear => 25.0,
        _ => 35.0,
    }
}

fn build_signal(
    input: &DetectionInputs,
    signal_type: &str,
    price: f64,
    rsi_value: f64,
    volume_ratio: f64,
    vwap: f64,
) -> BuySignal {
    BuySignal {
        code: input.watchlist.code.clone(),
        name: input.watchlist.name.clone(),
        signal_type: signal_type.to_string(),
        signal_price: price,
        llm_score: input.watchlist.llm_score,
        hybrid_score: input.watchlist.hybrid_score,
        trade_tier: input.watchlist.trade_tier,
        risk_tag: input.watchlist.risk_tag,
        market_regime: input.context.market_regime,
        source: "signal_detector".to_string(),
        rsi: rsi_value,
        volume_ratio,
        vwap,
        position_multiplier: input.context.position_multiplier,
        sector: input.watchlist.sector.clone(),
        timestamp: input.now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RiskTag, TradeTier, VixRegime};
    use chrono::{NaiveDate, TimeZone};

    fn watchlist() -> WatchlistEntry {
        WatchlistEntry {
            code: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            hybrid_score: 60.0,
            llm_score: 60.0,
            trade_tier: TradeTier::Tier1,
            risk_tag: RiskTag::Neutral,
            sector: "Semiconductors".to_string(),
            rank: 1,
            scored_at: Utc::now() - chrono::Duration::days(3),
        }
    }

    fn base_context() -> TradingContext {
        TradingContext {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            market_regime: crate::types::MarketRegime::Bull,
            position_multiplier: 1.0,
            stop_loss_multiplier: 1.0,
            vix_regime: VixRegime::Normal,
            risk_off_level: 0,
            favor_sectors: Vec::new(),
            avoid_sectors: Vec::new(),
        }
    }

    fn candles() -> Vec<DailyCandle> {
        (0..30)
            .map(|i| DailyCandle {
                date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                open: 70_000.0,
                high: 71_000.0,
                low: 69_000.0,
                close: 70_000.0 + i as f64 * 10.0,
                volume: 100_000.0,
            })
            .collect()
    }

    /// 20 flat bars at 100, then a pop to 115 that both crosses MA5 above
    /// MA20 and (via the following bar's elevated forming-bar volume)
    /// clears the golden cross's 1.5x volume-confirmation requirement.
    fn seed_golden_cross(engine: &BarEngine, code: &str) {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for i in 0..20i64 {
            engine.ingest(&crate::types::Tick {
                code: code.to_string(),
                price: 100.0,
                high_of_day: 100.0,
                volume_delta: 10.0,
                server_timestamp: base + chrono::Duration::seconds(i * 61),
            });
        }
        engine.ingest(&crate::types::Tick {
            code: code.to_string(),
            price: 115.0,
            high_of_day: 115.0,
            volume_delta: 15.0,
            server_timestamp: base + chrono::Duration::seconds(20 * 61),
        });
        engine.ingest(&crate::types::Tick {
            code: code.to_string(),
            price: 115.0,
            high_of_day: 115.0,
            volume_delta: 20.0,
            server_timestamp: base + chrono::Duration::seconds(21 * 61),
        });
    }

    fn std_input<'a>(watchlist: &'a WatchlistEntry, context: &'a TradingContext, daily: &'a [DailyCandle]) -> DetectionInputs<'a> {
        DetectionInputs {
            watchlist,
            context,
            daily_candles: daily,
            cooldown_remaining_secs: None,
            stoploss_cooldown_active: false,
            sell_cooldown_active: false,
            now: Utc::now(),
            now_kst: NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
        }
    }

    #[test]
    fn insufficient_bars_yields_gate_rejection() {
        let engine = BarEngine::new();
        engine.ingest(&crate::types::Tick {
            code: "005930".to_string(),
            price: 70_000.0,
            high_of_day: 70_000.0,
            volume_delta: 10.0,
            server_timestamp: Utc::now(),
        });
        let watchlist = watchlist();
        let context = base_context();
        let daily = candles();
        let input = std_input(&watchlist, &context, &daily);
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let pending = MomentumConfirmations::new();
        let outcome = detect(&engine, &input, &scanner, &risk, &pending);
        assert!(matches!(outcome, DetectionOutcome::GateRejected(GateRejection::InsufficientBars { .. })));
    }

    #[test]
    fn golden_cross_fires_after_gates_pass() {
        let engine = BarEngine::new();
        seed_golden_cross(&engine, "005930");
        let watchlist = watchlist();
        let context = base_context();
        let daily = candles();
        let input = std_input(&watchlist, &context, &daily);
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let pending = MomentumConfirmations::new();
        let outcome = detect(&engine, &input, &scanner, &risk, &pending);
        match outcome {
            DetectionOutcome::Signal(sig) => {
                assert_eq!(sig.signal_type, "GOLDEN_CROSS");
                assert_eq!(sig.signal_price, 115.0);
            }
            other => panic!("expected a signal, got {other:?}"),
        }
    }

    #[test]
    fn bearish_regime_blocks_before_strategy_cascade() {
        let engine = BarEngine::new();
        seed_golden_cross(&engine, "005930");
        let watchlist = watchlist();
        let mut context = base_context();
        context.market_regime = crate::types::MarketRegime::Bear;
        let daily = candles();
        let input = std_input(&watchlist, &context, &daily);
        let scanner = ScannerConfig::default();
        let risk = RiskConfig::default();
        let pending = MomentumConfirmations::new();
        let outcome = detect(&engine, &input, &scanner, &risk, &pending);
        assert!(matches!(outcome, DetectionOutcome::GateRejected(GateRejection::MarketRegime { .. })));
    }

    #[test]
    fn momentum_signal_waits_for_confirmation_bar() {
        // 5-bar return of ~3% with no golden cross / dip pattern: flat run-up.
        let engine = BarEngine::new();
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for i in 0..25i64 {
            engine.ingest(&crate::types::Tick {
                code: "005930".to_string(),
                price: 100.0,
                high_of_day: 100.0,
                volume_delta: 10.0,
                server_timestamp: base + chrono::Duration::seconds(i * 61),
            });
        }
        for (i, px) in [101.0, 101.5, 102.0, 102.5, 103.0].into_iter().enumerate() {
            engine.ingest(&crate::types::Tick {
                code: "005930".to_string(),
                price: px,
                high_of_day: px,
                volume_delta: 10.0,
                server_timestamp: base + chrono::Duration::seconds((25 + i as i64) * 61),
            });
        }
        let watchlist = watchlist();
        let mut context = base_context();
        context.market_regime = crate::types::MarketRegime::Sideways;
        let daily = candles();
        let input = std_input(&watchlist, &context, &daily);
        // This fixture is a monotonic run-up, which pins Wilder's RSI at its
        // ceiling (no down-moves ever enter the average) — not realistic,
        // but irrelevant to what this test actually exercises, so the RSI
        // gate is relaxed to keep the scenario focused on the confirmation
        // buffer rather than on sourcing a fully RSI-realistic fixture.
        let scanner = ScannerConfig { rsi_cap_default: 100.0, ..ScannerConfig::default() };
        let risk = RiskConfig::default();
        let pending = MomentumConfirmations::new();

        // First completed bar with the qualifying 5-bar return: signal is
        // held pending, not emitted yet.
        let outcome = detect(&engine, &input, &scanner, &risk, &pending);
        assert!(matches!(outcome, DetectionOutcome::NoStrategyMatch));
        assert!(pending.pending.lock().contains_key("005930"));

        // Next bar: price has not fallen below the pending signal price, so
        // the confirmation buffer (1 bar by default) now emits.
        engine.ingest(&crate::types::Tick {
            code: "005930".to_string(),
            price: 103.5,
            high_of_day: 103.5,
            volume_delta: 10.0,
            server_timestamp: base + chrono::Duration::seconds(31 * 61),
        });
        let outcome = detect(&engine, &input, &scanner, &risk, &pending);
        assert!(matches!(outcome, DetectionOutcome::Signal(_)));
    }

    #[test]
    fn conviction_candidate_in_sideways_requires_hybrid_75() {
        let scanner = ScannerConfig::default();
        let mut watchlist = watchlist();
        watchlist.hybrid_score = 70.0; // clears the generic 70/72 floor...
        watchlist.llm_score = 80.0;
        watchlist.scored_at = Utc::now();
        let mut context = base_context();
        context.market_regime = crate::types::MarketRegime::Sideways;
        let daily = candles();
        let mut input = std_input(&watchlist, &context, &daily);
        input.now_kst = NaiveTime::from_hms_opt(9, 30, 0).unwrap(); // inside the conviction window

        // ...but SIDEWAYS demands hybrid_score >= 75 on top of that, so this
        // candidate must not qualify even though every other condition
        // (window, RSI, VWAP band, gain cap) is satisfied below.
        assert!(!is_conviction_candidate(&input, &scanner, 70_000.0, 70_000.0, 50.0));

        watchlist.hybrid_score = 75.0;
        let mut input = std_input(&watchlist, &context, &daily);
        input.now_kst = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        assert!(is_conviction_candidate(&input, &scanner, 70_000.0, 70_000.0, 50.0));
    }

    #[test]
    fn rsi_rebound_threshold_matches_regime_table() {
        assert_eq!(rsi_rebound_threshold(crate::types::MarketRegime::Sideways), 40.0);
        assert_eq!(rsi_rebound_threshold(crate::types::MarketRegime::Bear), 30.0);
        assert_eq!(rsi_rebound_threshold(crate::types::MarketRegime::StrongBear), 25.0);
        assert_eq!(rsi_rebound_threshold(crate::types::MarketRegime::Bull), 35.0);
    }
}
