// =============================================================================
// Sell Executor — lock, confirm, cooldown
// =============================================================================
//
// Mirrors `buy_executor.rs`'s lock/place/poll-for-fill shape, generalized to
// a market-only sell with a market-hours/emergency-stop gate the buy side
// doesn't need, manual/forced-liquidation bypass, and a cooldown side-effect
// plan for the caller to apply.
// =============================================================================

use std::time::Duration;

use chrono::NaiveTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::client::{KisClient, OrderType, Side};
use crate::bus::cache::ScalarCache;
use crate::config::Config;
use crate::error::{ExecutorSkip, FillOutcome};
use crate::types::SellOrder;

const SELL_LOCK_TTL_SECS: u64 = 30;
pub const STOPLOSS_COOLDOWN_DAYS: i64 = 3;
pub const SELL_COOLDOWN_HOURS: i64 = 24;

/// Facts gathered by the caller before invoking the executor.
pub struct SellContext {
    pub emergency_stop: bool,
    pub now_kst: NaiveTime,
    pub held_quantity: f64,
    pub avg_buy_price: f64,
}

pub struct SellOutcome {
    pub order_no: Option<String>,
    pub fill_price: f64,
    pub filled_qty: f64,
    pub profit_pct: f64,
    /// `true` when the fill fully closes the held position — callers purge
    /// per-code dynamic state and delete the `Position` row on this.
    pub full_exit: bool,
    pub set_stoploss_cooldown: bool,
    pub set_sell_cooldown: bool,
}

fn parse_hm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

/// Short-circuit rejections that never need a broker round-trip. A free
/// function so it is testable without a live broker/cache connection.
fn check_short_circuit(order: &SellOrder, ctx: &SellContext, market_open: &str, market_close: &str) -> Result<(), ExecutorSkip> {
    if !order.is_manual_override() {
        let open = parse_hm(market_open);
        let close = parse_hm(market_close);
        if ctx.now_kst < open || ctx.now_kst >= close {
            return Err(ExecutorSkip::Cooldown("outside market hours".to_string()));
        }
        if ctx.emergency_stop {
            return Err(ExecutorSkip::EmergencyStop);
        }
    }
    if ctx.held_quantity <= 0.0 {
        return Err(ExecutorSkip::NotHolding);
    }
    Ok(())
}

pub struct SellExecutor {
    client: KisClient,
    locks: ScalarCache,
    config: Config,
}

impl SellExecutor {
    pub fn new(client: KisClient, locks: ScalarCache, config: Config) -> Self {
        Self { client, locks, config }
    }

    fn short_circuit(&self, order: &SellOrder, ctx: &SellContext) -> Result<(), ExecutorSkip> {
        check_short_circuit(order, ctx, self.config.sell.market_open, self.config.sell.market_close)
    }

    /// Run the full sell pipeline for one `SellOrder`. Returns `Ok(None)` if
    /// the order was placed but never filled (cancel-after-timeout path, a
    /// condition treated as serious — see the retry backstop principle).
    pub async fn execute(
        &self,
        order: &SellOrder,
        ctx: &SellContext,
    ) -> Result<Option<SellOutcome>, ExecutorSkip> {
        self.short_circuit(order, ctx)?;

        let lock_key = format!("lock:sell:{}", order.code);
        let token = Uuid::new_v4().to_string();
        if !self.locks.acquire_lock(&lock_key, SELL_LOCK_TTL_SECS, &token).await {
            return Err(ExecutorSkip::LockContention { key: lock_key });
        }

        match self.execute_locked(order, ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(skip) => {
                self.locks.release_lock(&lock_key).await;
                Err(skip)
            }
        }
    }

    async fn execute_locked(
        &self,
        order: &SellOrder,
        ctx: &SellContext,
    ) -> Result<Option<SellOutcome>, ExecutorSkip> {
        let quantity = order.quantity.min(ctx.held_quantity);
        if quantity <= 0.0 {
            return Err(ExecutorSkip::ZeroQuantity);
        }

        let price = match self.client.snapshot(&order.code).await {
            Ok(snap) if snap.price > 0.0 => snap.price,
            _ if order.current_price > 0.0 => order.current_price,
            _ => return Err(ExecutorSkip::PortfolioGuard("no valid price snapshot".to_string())),
        };

        let fill = self.place_and_confirm(&order.code, quantity, price).await;
        let full_exit = (ctx.held_quantity - quantity).abs() < f64::EPSILON;

        match fill {
            FillOutcome::Filled { avg_price, filled_qty } => {
                let profit_pct = if ctx.avg_buy_price > 0.0 {
                    (avg_price - ctx.avg_buy_price) / ctx.avg_buy_price * 100.0
                } else {
                    0.0
                };
                info!(code = %order.code, reason = %order.sell_reason, avg_price, filled_qty, profit_pct, "sell filled");
                Ok(Some(SellOutcome {
                    order_no: None,
                    fill_price: avg_price,
                    filled_qty,
                    profit_pct,
                    full_exit,
                    set_stoploss_cooldown: order.triggers_stoploss_cooldown(),
                    set_sell_cooldown: true,
                }))
            }
            FillOutcome::NotFilledCancelled => {
                warn!(code = %order.code, "sell order not filled, cancelled");
                Err(ExecutorSkip::PortfolioGuard("sell not filled, cancelled".to_string()))
            }
            FillOutcome::DryRun { synthetic_order_no } => Ok(Some(SellOutcome {
                order_no: Some(synthetic_order_no),
                fill_price: price,
                filled_qty: quantity,
                profit_pct: order.profit_pct,
                full_exit,
                set_stoploss_cooldown: order.triggers_stoploss_cooldown(),
                set_sell_cooldown: true,
            })),
        }
    }

    async fn place_and_confirm(&self, code: &str, quantity: f64, price: f64) -> FillOutcome {
        if self.config.infra.dry_run {
            return FillOutcome::DryRun {
                synthetic_order_no: format!("DRYRUN-{}", Uuid::new_v4()),
            };
        }

        let result = self.client.place_order(code, Side::Sell, quantity, OrderType::Market, None).await;
        let order_no = match result {
            Ok(r) if r.success => r.order_no,
            _ => return FillOutcome::NotFilledCancelled,
        };
        let Some(order_no) = order_no else {
            return FillOutcome::NotFilledCancelled;
        };

        let poll_interval = Duration::from_secs(self.config.sell.confirm_poll_interval_secs);
        for _ in 0..self.config.sell.confirm_max_retries {
            if let Some(status) = self.client.order_status(&order_no).await {
                if status.filled {
                    return FillOutcome::Filled {
                        avg_price: status.avg_price,
                        filled_qty: status.filled_qty,
                    };
                }
            }
            tokio::time::sleep(poll_interval).await;
        }

        let _ = self.client.cancel(&order_no).await;
        let _ = price;
        FillOutcome::NotFilledCancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_order(reason: &str) -> SellOrder {
        SellOrder {
            code: "005930".to_string(),
            name: "Samsung Electronics".to_string(),
            sell_reason: reason.to_string(),
            current_price: 70_000.0,
            quantity: 10.0,
            buy_price: 65_000.0,
            profit_pct: 7.7,
            holding_days: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn outside_market_hours_blocks_non_manual_sell() {
        let ctx = SellContext {
            emergency_stop: false,
            now_kst: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            held_quantity: 10.0,
            avg_buy_price: 65_000.0,
        };
        let order = sample_order("STOP_LOSS");
        assert!(check_short_circuit(&order, &ctx, "09:00", "15:30").is_err());
    }

    #[test]
    fn manual_override_bypasses_market_hours_and_emergency_stop() {
        let ctx = SellContext {
            emergency_stop: true,
            now_kst: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            held_quantity: 10.0,
            avg_buy_price: 65_000.0,
        };
        let order = sample_order("FORCED_LIQUIDATION");
        assert!(check_short_circuit(&order, &ctx, "09:00", "15:30").is_ok());
    }

    #[test]
    fn not_holding_is_rejected() {
        let ctx = SellContext {
            emergency_stop: false,
            now_kst: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            held_quantity: 0.0,
            avg_buy_price: 65_000.0,
        };
        let order = sample_order("STOP_LOSS");
        assert!(matches!(
            check_short_circuit(&order, &ctx, "09:00", "15:30"),
            Err(ExecutorSkip::NotHolding)
        ));
    }

    #[test]
    fn emergency_stop_blocks_normal_sell() {
        let ctx = SellContext {
            emergency_stop: true,
            now_kst: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            held_quantity: 10.0,
            avg_buy_price: 65_000.0,
        };
        let order = sample_order("RSI_OVERBOUGHT");
        assert!(matches!(
            check_short_circuit(&order, &ctx, "09:00", "15:30"),
            Err(ExecutorSkip::EmergencyStop)
        ));
    }
}
