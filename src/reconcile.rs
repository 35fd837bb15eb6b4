// =============================================================================
// Reconciliation — broker-vs-local position diff and repair
// =============================================================================
//
// Runs on a periodic timer against the broker's authoritative `balance()`
// snapshot. The broker is always right: every branch below either adopts
// the broker's numbers into the local `positions` table or drops a local
// row the broker no longer backs, and every corrective action is recorded
// as a human-readable string for the audit log rather than applied silently.
// =============================================================================

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::client::{BrokerPosition, KisClient};
use crate::persistence::{synthetic_trade_log, PositionRepository, TradeLogRepository};
use crate::types::{Position, TradeType};

const PRICE_MISMATCH_TOLERANCE_PCT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    OnlyInBroker(BrokerPosition),
    OnlyLocal(Position),
    QuantityMismatch { code: String, broker_qty: f64, local_qty: f64 },
    PriceMismatch { code: String, broker_price: f64, local_price: f64 },
    Matched { code: String },
}

/// Summary of a single reconciliation pass — what each category of
/// discrepancy added up to, and the corrective actions actually taken.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub matched: u32,
    pub only_in_broker: u32,
    pub only_locally: u32,
    pub quantity_mismatches: u32,
    pub price_mismatches: u32,
    pub actions: Vec<String>,
}

/// Categorize the broker's position list against the local `positions`
/// table. A pure function over already-fetched data, so the category logic
/// is testable without a live broker or database connection.
pub fn categorize(broker_positions: &[BrokerPosition], local_positions: &[Position]) -> Vec<Discrepancy> {
    let mut out = Vec::new();

    for bp in broker_positions {
        match local_positions.iter().find(|p| p.code == bp.code) {
            None => out.push(Discrepancy::OnlyInBroker(bp.clone())),
            Some(local) => {
                let qty_mismatch = (bp.quantity - local.quantity).abs() > f64::EPSILON;
                let price_mismatch = local.avg_buy_price > 0.0
                    && ((bp.avg_buy_price - local.avg_buy_price).abs() / local.avg_buy_price * 100.0)
                        > PRICE_MISMATCH_TOLERANCE_PCT;

                if qty_mismatch {
                    out.push(Discrepancy::QuantityMismatch {
                        code: bp.code.clone(),
                        broker_qty: bp.quantity,
                        local_qty: local.quantity,
                    });
                } else if price_mismatch {
                    out.push(Discrepancy::PriceMismatch {
                        code: bp.code.clone(),
                        broker_price: bp.avg_buy_price,
                        local_price: local.avg_buy_price,
                    });
                } else {
                    out.push(Discrepancy::Matched { code: bp.code.clone() });
                }
            }
        }
    }

    for local in local_positions {
        if !broker_positions.iter().any(|bp| bp.code == local.code) {
            out.push(Discrepancy::OnlyLocal(local.clone()));
        }
    }

    out
}

pub struct Reconciler {
    client: KisClient,
    positions: PositionRepository,
    trade_logs: TradeLogRepository,
}

impl Reconciler {
    pub fn new(client: KisClient, positions: PositionRepository, trade_logs: TradeLogRepository) -> Self {
        Self { client, positions, trade_logs }
    }

    /// Fetch the broker's balance, diff it against the local table, and
    /// apply every corrective action. A broker fetch failure aborts the run
    /// entirely rather than reconciling against a stale or empty list.
    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileReport> {
        let balance = self.client.balance().await?;
        let local = self.positions.list_all().await?;
        let discrepancies = categorize(&balance.positions, &local);

        let mut report = ReconcileReport::default();
        for d in discrepancies {
            self.apply(d, &mut report).await;
        }

        if report.only_in_broker + report.only_locally + report.quantity_mismatches + report.price_mismatches > 0 {
            warn!(
                matched = report.matched,
                only_in_broker = report.only_in_broker,
                only_locally = report.only_locally,
                quantity_mismatches = report.quantity_mismatches,
                price_mismatches = report.price_mismatches,
                "reconciliation found and repaired discrepancies"
            );
        } else {
            info!(matched = report.matched, "reconciliation clean");
        }

        Ok(report)
    }

    async fn apply(&self, d: Discrepancy, report: &mut ReconcileReport) {
        match d {
            Discrepancy::OnlyInBroker(bp) => {
                let now = Utc::now();
                let position = Position {
                    code: bp.code.clone(),
                    name: bp.name.clone(),
                    quantity: bp.quantity,
                    avg_buy_price: bp.avg_buy_price,
                    total_buy_amount: bp.avg_buy_price * bp.quantity,
                    sector: String::new(),
                    high_watermark: bp.avg_buy_price,
                    stop_loss_price: bp.avg_buy_price * 0.9,
                    bought_at: now,
                    scale_out_level: 0,
                    rsi_sold_flag: false,
                    profit_floor_active: false,
                    profit_floor_level: 0.0,
                };
                if let Err(e) = self.positions.upsert(&position).await {
                    warn!(code = %bp.code, error = %e, "failed to insert broker-only position");
                    return;
                }
                let log = synthetic_trade_log(&bp.code, &bp.name, TradeType::Buy, bp.quantity, bp.avg_buy_price, now);
                let _ = self.trade_logs.insert(&log).await;
                report.only_in_broker += 1;
                report.actions.push(format!(
                    "{}: position found at broker but not locally — inserted {} @ {}",
                    bp.code, bp.quantity, bp.avg_buy_price
                ));
            }
            Discrepancy::OnlyLocal(local) => {
                if let Err(e) = self.positions.delete(&local.code).await {
                    warn!(code = %local.code, error = %e, "failed to delete local-only position");
                    return;
                }
                let now = Utc::now();
                let log = synthetic_trade_log(
                    &local.code,
                    &local.name,
                    TradeType::Sell,
                    local.quantity,
                    local.avg_buy_price,
                    now,
                );
                let _ = self.trade_logs.insert(&log).await;
                report.only_locally += 1;
                report.actions.push(format!(
                    "{}: position held locally but not at broker — removed (treated as externally closed)",
                    local.code
                ));
            }
            Discrepancy::QuantityMismatch { code, broker_qty, local_qty } => {
                if let Ok(Some(mut position)) = self.positions.get(&code).await {
                    position.quantity = broker_qty;
                    position.total_buy_amount = position.avg_buy_price * broker_qty;
                    position.stop_loss_price = position.avg_buy_price * 0.9;
                    if let Err(e) = self.positions.upsert(&position).await {
                        warn!(code = %code, error = %e, "failed to correct quantity mismatch");
                        return;
                    }
                }
                report.quantity_mismatches += 1;
                report.actions.push(format!(
                    "{code}: quantity mismatch, broker={broker_qty} local={local_qty} — adopted broker quantity"
                ));
            }
            Discrepancy::PriceMismatch { code, broker_price, local_price } => {
                if let Ok(Some(mut position)) = self.positions.get(&code).await {
                    position.avg_buy_price = broker_price;
                    position.total_buy_amount = broker_price * position.quantity;
                    position.stop_loss_price = broker_price * 0.9;
                    if let Err(e) = self.positions.upsert(&position).await {
                        warn!(code = %code, error = %e, "failed to correct price mismatch");
                        return;
                    }
                }
                report.price_mismatches += 1;
                report.actions.push(format!(
                    "{code}: avg buy price mismatch, broker={broker_price} local={local_price} — adopted broker price"
                ));
            }
            Discrepancy::Matched { code: _ } => {
                report.matched += 1;
            }
        }
    }

    /// Advance a matched position's high watermark if the broker's current
    /// price has pushed above what is locally recorded. Called separately
    /// from `reconcile_once` since it needs a live price snapshot per code
    /// rather than the balance call's average-price view.
    pub async fn bump_watermark_if_higher(&self, code: &str, broker_price: f64, local_watermark: f64) {
        if broker_price > local_watermark {
            if let Err(e) = self.positions.bump_watermark(code, broker_price).await {
                warn!(code, error = %e, "failed to bump watermark during reconciliation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn local_position(code: &str, qty: f64, avg_price: f64) -> Position {
        Position {
            code: code.to_string(),
            name: "Test Corp".to_string(),
            quantity: qty,
            avg_buy_price: avg_price,
            total_buy_amount: qty * avg_price,
            sector: "Tech".to_string(),
            high_watermark: avg_price,
            stop_loss_price: avg_price * 0.9,
            bought_at: Utc::now(),
            scale_out_level: 0,
            rsi_sold_flag: false,
            profit_floor_active: false,
            profit_floor_level: 0.0,
        }
    }

    fn broker_position(code: &str, qty: f64, avg_price: f64) -> BrokerPosition {
        BrokerPosition {
            code: code.to_string(),
            name: "Test Corp".to_string(),
            quantity: qty,
            avg_buy_price: avg_price,
        }
    }

    #[test]
    fn flags_broker_only_position() {
        let broker = vec![broker_position("005930", 10.0, 70_000.0)];
        let local = vec![];
        let result = categorize(&broker, &local);
        assert_eq!(result, vec![Discrepancy::OnlyInBroker(broker_position("005930", 10.0, 70_000.0))]);
    }

    #[test]
    fn flags_local_only_position() {
        let broker = vec![];
        let local = vec![local_position("005930", 10.0, 70_000.0)];
        let result = categorize(&broker, &local);
        assert_eq!(result, vec![Discrepancy::OnlyLocal(local_position("005930", 10.0, 70_000.0))]);
    }

    #[test]
    fn flags_quantity_mismatch() {
        let broker = vec![broker_position("005930", 15.0, 70_000.0)];
        let local = vec![local_position("005930", 10.0, 70_000.0)];
        let result = categorize(&broker, &local);
        assert_eq!(
            result,
            vec![Discrepancy::QuantityMismatch { code: "005930".to_string(), broker_qty: 15.0, local_qty: 10.0 }]
        );
    }

    #[test]
    fn flags_price_mismatch_past_tolerance() {
        let broker = vec![broker_position("005930", 10.0, 71_000.0)];
        let local = vec![local_position("005930", 10.0, 70_000.0)];
        let result = categorize(&broker, &local);
        assert_eq!(
            result,
            vec![Discrepancy::PriceMismatch { code: "005930".to_string(), broker_price: 71_000.0, local_price: 70_000.0 }]
        );
    }

    #[test]
    fn small_price_drift_within_tolerance_is_matched() {
        let broker = vec![broker_position("005930", 10.0, 70_100.0)];
        let local = vec![local_position("005930", 10.0, 70_000.0)];
        let result = categorize(&broker, &local);
        assert_eq!(result, vec![Discrepancy::Matched { code: "005930".to_string() }]);
    }

    #[test]
    fn exact_match_is_clean() {
        let broker = vec![broker_position("005930", 10.0, 70_000.0)];
        let local = vec![local_position("005930", 10.0, 70_000.0)];
        let result = categorize(&broker, &local);
        assert_eq!(result, vec![Discrepancy::Matched { code: "005930".to_string() }]);
    }
}
