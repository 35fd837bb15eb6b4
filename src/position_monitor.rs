// =============================================================================
// Position Monitor — exit-rule cascade driving the live position map
// =============================================================================
//
// Collects matched exits under one write lock and never closes a position
// in-place; a refresh-then-evaluate tick loop drives a 9-rule regime-aware
// exit cascade over the broker-backed `Position` / `DynamicPositionState`
// pair defined in `types.rs`.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::SellConfig;
use crate::indicators::{atr, macd, rsi, sma};
use crate::types::{DailyCandle, MarketRegime, Position, SellOrder};

/// Per-code analytics refreshed once per 300 s broker-sync cycle — the
/// per-tick hot path only ever reads these, never recomputes them.
#[derive(Debug, Clone, Copy)]
pub struct RefreshedAnalytics {
    pub atr: f64,
    pub rsi: f64,
    pub death_cross: bool,
    pub macd_bearish_divergence: bool,
}

/// Recompute the once-per-refresh analytics for one code from its daily
/// candle history.
pub fn refresh_analytics(candles: &[DailyCandle], price: f64) -> RefreshedAnalytics {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi_value = rsi::current_rsi(&closes, 14).map(|(v, _)| v).unwrap_or(50.0);
    let atr_value = atr::clamped_atr(candles, 14, price);
    let death_cross = sma::crossed_below_by(&closes, 5, 20, 0.2);
    let macd_bearish_divergence = macd::bearish_divergence(&closes, 10, 0.98);
    RefreshedAnalytics {
        atr: atr_value,
        rsi: rsi_value,
        death_cross,
        macd_bearish_divergence,
    }
}

/// Everything a single tick's exit evaluation needs, already gathered by the
/// caller from the position map, the dynamic-state cache, and the cached
/// refresh analytics.
pub struct PositionContext<'a> {
    pub position: &'a Position,
    pub price: f64,
    pub watermark: f64,
    pub high_profit_pct: f64,
    pub analytics: RefreshedAnalytics,
    pub holding_days: i64,
    pub scale_out_level: u8,
    pub rsi_sold_flag: bool,
    pub regime: MarketRegime,
    pub now: DateTime<Utc>,
}

/// One matched exit rule: a reason string and the fraction of the held
/// quantity to sell (1.0 = full close).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitMatch {
    pub reason: &'static str,
    pub fraction: f64,
}

fn scale_out_levels(sell: &SellConfig, regime: MarketRegime) -> Vec<f64> {
    sell.scale_out_levels_by_regime
        .get(&regime.to_string())
        .cloned()
        .unwrap_or_else(|| vec![3.0, 7.0, 12.0, 18.0])
}

fn macro_stop_mult(sell: &SellConfig, regime: MarketRegime) -> f64 {
    sell.macro_stop_mult_by_regime.get(&regime.to_string()).copied().unwrap_or(1.0)
}

fn trailing_drop(sell: &SellConfig, regime: MarketRegime) -> f64 {
    sell.trailing_drop_by_regime.get(&regime.to_string()).copied().unwrap_or(0.03)
}

fn regime_max_days(sell: &SellConfig, regime: MarketRegime) -> i64 {
    sell.regime_max_days.get(&regime.to_string()).copied().unwrap_or(35)
}

/// Evaluate the 9-rule exit cascade in strict priority order, first match
/// wins.
pub fn evaluate(ctx: &PositionContext, sell: &SellConfig) -> Option<ExitMatch> {
    let profit = ctx.position.profit_pct(ctx.price);
    let buy_price = ctx.position.avg_buy_price;
    let stop_mult = macro_stop_mult(sell, ctx.regime);

    // Rule 1: hard stop. Reason is STOP_LOSS, same tag the ATR and fixed
    // stops below use — all three are gap-down/stop-loss safety overrides
    // and all three arm the stoploss cooldown on the sell side.
    if profit <= sell.hard_stop_pct {
        return Some(ExitMatch { reason: "STOP_LOSS", fraction: 1.0 });
    }

    // Rule 2/3: profit lock, L2 checked first (more urgent than L1).
    if ctx.high_profit_pct >= sell.profit_lock_l2_activation_pct && profit < sell.profit_lock_l2_floor_pct {
        return Some(ExitMatch { reason: "TRAILING_STOP", fraction: 1.0 });
    }
    if ctx.high_profit_pct >= sell.profit_lock_l1_activation_pct && profit < sell.profit_lock_l1_floor_pct {
        return Some(ExitMatch { reason: "TRAILING_STOP", fraction: 1.0 });
    }

    // Rule 4: ATR trailing stop.
    let atr_stop_price = buy_price - ctx.analytics.atr * 2.0 * stop_mult;
    if ctx.price <= atr_stop_price {
        return Some(ExitMatch { reason: "STOP_LOSS", fraction: 1.0 });
    }

    // Rule 5: fixed stop.
    if profit <= sell.fixed_stop_loss_pct * stop_mult {
        return Some(ExitMatch { reason: "STOP_LOSS", fraction: 1.0 });
    }

    // Rule 6: trailing take-profit.
    let drop = trailing_drop(sell, ctx.regime);
    if ctx.high_profit_pct >= sell.trailing_activation_pct
        && ctx.price <= ctx.watermark * (1.0 - drop)
        && profit >= sell.trailing_min_profit_pct
    {
        return Some(ExitMatch { reason: "TRAILING_STOP", fraction: 1.0 });
    }

    // Rule 7: fixed profit target (only meaningful when trailing never armed).
    if ctx.high_profit_pct < sell.trailing_activation_pct && profit >= sell.profit_target_pct {
        return Some(ExitMatch { reason: "PROFIT_TARGET", fraction: 1.0 });
    }

    // Rule 8: scale-out, ascending levels by regime.
    let levels = scale_out_levels(sell, ctx.regime);
    let level_idx = ctx.scale_out_level as usize;
    if let Some(&threshold) = levels.get(level_idx) {
        if profit >= threshold {
            let fraction = if level_idx >= 3 { 0.15 } else { 0.25 };
            let remaining_after = ctx.position.quantity * (1.0 - fraction);
            let fraction = if remaining_after < 10.0 { 1.0 } else { fraction };
            return Some(ExitMatch { reason: "PROFIT_TARGET", fraction });
        }
    }

    // Rule 9: RSI overbought (once per position).
    if ctx.analytics.rsi >= sell.rsi_overbought_threshold
        && profit >= sell.rsi_overbought_min_profit_pct
        && !ctx.rsi_sold_flag
    {
        return Some(ExitMatch { reason: "RSI_OVERBOUGHT", fraction: 0.5 });
    }

    // Rule 10: time exit, max holding days by regime.
    if ctx.holding_days >= regime_max_days(sell, ctx.regime) {
        return Some(ExitMatch { reason: "TIME_EXIT", fraction: 1.0 });
    }

    let _ = ctx.analytics.death_cross;
    let _ = ctx.analytics.macd_bearish_divergence;
    None
}

/// Build the `SellOrder` for a matched exit, clamping quantity to the held
/// amount and rounding down to whole shares.
pub fn build_sell_order(ctx: &PositionContext, exit: ExitMatch) -> SellOrder {
    let quantity = (ctx.position.quantity * exit.fraction).floor().max(1.0).min(ctx.position.quantity);
    SellOrder {
        code: ctx.position.code.clone(),
        name: ctx.position.name.clone(),
        sell_reason: exit.reason.to_string(),
        current_price: ctx.price,
        quantity,
        buy_price: ctx.position.avg_buy_price,
        profit_pct: ctx.position.profit_pct(ctx.price),
        holding_days: ctx.holding_days,
        timestamp: ctx.now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(buy_price: f64, quantity: f64, bought_days_ago: i64) -> Position {
        Position {
            code: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            quantity,
            avg_buy_price: buy_price,
            total_buy_amount: buy_price * quantity,
            sector: "Semiconductors".to_string(),
            high_watermark: buy_price,
            stop_loss_price: buy_price * 0.9,
            bought_at: Utc::now() - chrono::Duration::days(bought_days_ago),
            scale_out_level: 0,
            rsi_sold_flag: false,
            profit_floor_active: false,
            profit_floor_level: 0.0,
        }
    }

    fn analytics() -> RefreshedAnalytics {
        RefreshedAnalytics { atr: 1_000.0, rsi: 50.0, death_cross: false, macd_bearish_divergence: false }
    }

    fn ctx<'a>(position: &'a Position, price: f64, watermark: f64, high_profit_pct: f64) -> PositionContext<'a> {
        PositionContext {
            position,
            price,
            watermark,
            high_profit_pct,
            analytics: analytics(),
            holding_days: position.holding_days(Utc::now()),
            scale_out_level: position.scale_out_level,
            rsi_sold_flag: position.rsi_sold_flag,
            regime: MarketRegime::Sideways,
            now: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn hard_stop_wins_over_everything() {
        let pos = position(70_000.0, 10.0, 1);
        let sell = SellConfig::default();
        let input = ctx(&pos, 62_000.0, 70_000.0, 0.0);
        let m = evaluate(&input, &sell).unwrap();
        assert_eq!(m.reason, "STOP_LOSS");
        assert_eq!(m.fraction, 1.0);
    }

    #[test]
    fn profit_lock_l2_preferred_over_l1_when_both_match() {
        let pos = position(70_000.0, 10.0, 1);
        let sell = SellConfig::default();
        // high_profit 4% (past both L1 and L2 activation), current profit 0.2% (below both floors).
        let input = ctx(&pos, 70_140.0, 72_800.0, 4.0);
        let m = evaluate(&input, &sell).unwrap();
        assert_eq!(m.reason, "TRAILING_STOP");
    }

    #[test]
    fn scale_out_escalates_to_full_close_on_small_remainder() {
        let mut pos = position(70_000.0, 12.0, 5);
        pos.scale_out_level = 3; // L3 threshold = 18% for SIDEWAYS, fraction 15%
        let sell = SellConfig::default();
        let price = 70_000.0 * 1.20;
        let input = ctx(&pos, price, price, 20.0);
        let m = evaluate(&input, &sell).unwrap();
        // 12 * 0.85 = 10.2 remaining, not below 10 -> stays partial at 15%.
        assert_eq!(m.reason, "PROFIT_TARGET");
        assert_eq!(m.fraction, 0.15);
    }

    #[test]
    fn time_exit_fires_after_regime_max_days() {
        let pos = position(70_000.0, 10.0, 40);
        let sell = SellConfig::default();
        let input = ctx(&pos, 70_500.0, 70_500.0, 0.7);
        let m = evaluate(&input, &sell).unwrap();
        assert_eq!(m.reason, "TIME_EXIT");
    }

    #[test]
    fn healthy_position_has_no_exit() {
        let pos = position(70_000.0, 10.0, 1);
        let sell = SellConfig::default();
        let input = ctx(&pos, 70_200.0, 70_200.0, 0.3);
        assert!(evaluate(&input, &sell).is_none());
    }
}
