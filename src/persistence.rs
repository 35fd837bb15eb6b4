// =============================================================================
// Persistence — positions/trade_logs repositories
// =============================================================================
//
// Built in the same thin-wrapper-over-a-connection style as
// `bus::cache::ScalarCache` — one struct per table, plain `sqlx::query`
// (runtime-checked, since there is no live database to drive `query!`'s
// compile-time verification), with enum columns round-tripped through
// `serde_json` the way the rest of this codebase already serializes typed
// enums, rather than hand-rolling `sqlx::Type` impls for each one.
// =============================================================================

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::types::{MarketRegime, Position, TradeLog, TradeTier, TradeType};

fn enum_to_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn text_to_enum<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).ok()
}

/// Repository over the `positions` table. Only the Buy/Sell executors and
/// reconciliation write here; all other readers go through the gateway or
/// the cache.
#[derive(Clone)]
pub struct PositionRepository {
    pool: PgPool,
}

impl PositionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, position: &Position) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (code, name, qty, avg_buy_price, total_buy_amount, sector,
                 high_watermark, stop_loss_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name,
                qty = EXCLUDED.qty,
                avg_buy_price = EXCLUDED.avg_buy_price,
                total_buy_amount = EXCLUDED.total_buy_amount,
                sector = EXCLUDED.sector,
                high_watermark = EXCLUDED.high_watermark,
                stop_loss_price = EXCLUDED.stop_loss_price,
                updated_at = now()
            "#,
        )
        .bind(&position.code)
        .bind(&position.name)
        .bind(position.quantity)
        .bind(position.avg_buy_price)
        .bind(position.total_buy_amount)
        .bind(&position.sector)
        .bind(position.high_watermark)
        .bind(position.stop_loss_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, code: &str) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM positions WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, code: &str) -> sqlx::Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_position(&r)))
    }

    pub async fn list_all(&self) -> sqlx::Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions ORDER BY code")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_position).collect())
    }

    /// Advance `high_watermark` only — used by reconciliation's "matched with
    /// broker price higher than local watermark" case.
    pub async fn bump_watermark(&self, code: &str, new_watermark: f64) -> sqlx::Result<()> {
        sqlx::query("UPDATE positions SET high_watermark = $2, updated_at = now() WHERE code = $1")
            .bind(code)
            .bind(new_watermark)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_position(row: &sqlx::postgres::PgRow) -> Position {
    Position {
        code: row.try_get("code").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        quantity: row.try_get("qty").unwrap_or(0.0),
        avg_buy_price: row.try_get("avg_buy_price").unwrap_or(0.0),
        total_buy_amount: row.try_get("total_buy_amount").unwrap_or(0.0),
        sector: row.try_get("sector").unwrap_or_default(),
        high_watermark: row.try_get("high_watermark").unwrap_or(0.0),
        stop_loss_price: row.try_get("stop_loss_price").unwrap_or(0.0),
        bought_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        scale_out_level: 0,
        rsi_sold_flag: false,
        profit_floor_active: false,
        profit_floor_level: 0.0,
    }
}

/// Repository over the append-only `trade_logs` table.
#[derive(Clone)]
pub struct TradeLogRepository {
    pool: PgPool,
}

impl TradeLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, log: &TradeLog) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_logs
                (id, code, name, trade_type, qty, price, total_amount, reason,
                 strategy_signal, regime, llm_score, hybrid_score, trade_tier,
                 profit_pct, profit_amount, holding_days, trade_timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(log.id)
        .bind(&log.code)
        .bind(&log.name)
        .bind(enum_to_text(&log.trade_type))
        .bind(log.quantity)
        .bind(log.price)
        .bind(log.total_amount)
        .bind(&log.reason)
        .bind(&log.strategy_signal)
        .bind(log.regime.as_ref().map(enum_to_text))
        .bind(log.llm_score)
        .bind(log.hybrid_score)
        .bind(log.trade_tier.as_ref().map(enum_to_text))
        .bind(log.profit_pct)
        .bind(log.profit_amount)
        .bind(log.holding_days)
        .bind(log.trade_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent BUY row for `code` — the Sell Executor carries its
    /// `strategy_signal`/`regime` forward into the SELL row it writes.
    pub async fn latest_buy_for_code(&self, code: &str) -> sqlx::Result<Option<TradeLog>> {
        let row = sqlx::query(
            "SELECT * FROM trade_logs WHERE code = $1 AND trade_type = 'BUY' \
             ORDER BY trade_timestamp DESC LIMIT 1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_trade_log(&r)))
    }
}

fn row_to_trade_log(row: &sqlx::postgres::PgRow) -> TradeLog {
    let trade_type_text: String = row.try_get("trade_type").unwrap_or_default();
    let regime_text: Option<String> = row.try_get("regime").unwrap_or(None);
    let trade_tier_text: Option<String> = row.try_get("trade_tier").unwrap_or(None);

    TradeLog {
        id: row.try_get("id").unwrap_or_else(|_| uuid::Uuid::new_v4()),
        code: row.try_get("code").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        trade_type: text_to_enum::<TradeType>(&trade_type_text).unwrap_or(TradeType::Buy),
        quantity: row.try_get("qty").unwrap_or(0.0),
        price: row.try_get("price").unwrap_or(0.0),
        total_amount: row.try_get("total_amount").unwrap_or(0.0),
        reason: row.try_get("reason").unwrap_or_default(),
        strategy_signal: row.try_get("strategy_signal").unwrap_or(None),
        regime: regime_text.and_then(|t| text_to_enum::<MarketRegime>(&t)),
        llm_score: row.try_get("llm_score").unwrap_or(None),
        hybrid_score: row.try_get("hybrid_score").unwrap_or(None),
        trade_tier: trade_tier_text.and_then(|t| text_to_enum::<TradeTier>(&t)),
        profit_pct: row.try_get("profit_pct").unwrap_or(None),
        profit_amount: row.try_get("profit_amount").unwrap_or(None),
        holding_days: row.try_get("holding_days").unwrap_or(None),
        trade_timestamp: row.try_get("trade_timestamp").unwrap_or_else(|_| Utc::now()),
    }
}

/// Run embedded schema migrations at startup. A missing or broken schema
/// stops the process rather than degrading silently.
pub async fn run_migrations(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            qty DOUBLE PRECISION NOT NULL,
            avg_buy_price DOUBLE PRECISION NOT NULL,
            total_buy_amount DOUBLE PRECISION NOT NULL,
            sector TEXT NOT NULL,
            high_watermark DOUBLE PRECISION NOT NULL,
            stop_loss_price DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trade_logs (
            id UUID PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            trade_type TEXT NOT NULL,
            qty DOUBLE PRECISION NOT NULL,
            price DOUBLE PRECISION NOT NULL,
            total_amount DOUBLE PRECISION NOT NULL,
            reason TEXT NOT NULL,
            strategy_signal TEXT,
            regime TEXT,
            llm_score DOUBLE PRECISION,
            hybrid_score DOUBLE PRECISION,
            trade_tier TEXT,
            profit_pct DOUBLE PRECISION,
            profit_amount DOUBLE PRECISION,
            holding_days BIGINT,
            trade_timestamp TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS trade_logs_code_idx ON trade_logs (code, trade_timestamp DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Build a synthetic `TradeLog` for a reconciliation-inferred fill
/// (`reason='MANUAL_SYNC'`).
pub fn synthetic_trade_log(
    code: &str,
    name: &str,
    trade_type: TradeType,
    quantity: f64,
    price: f64,
    now: DateTime<Utc>,
) -> TradeLog {
    TradeLog {
        id: uuid::Uuid::new_v4(),
        code: code.to_string(),
        name: name.to_string(),
        trade_type,
        quantity,
        price,
        total_amount: price * quantity,
        reason: "MANUAL_SYNC".to_string(),
        strategy_signal: None,
        regime: None,
        llm_score: None,
        hybrid_score: None,
        trade_tier: None,
        profit_pct: None,
        profit_amount: None,
        holding_days: None,
        trade_timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn enum_round_trips_through_text() {
        let text = enum_to_text(&MarketRegime::StrongBull);
        assert_eq!(text, "STRONG_BULL");
        assert_eq!(text_to_enum::<MarketRegime>(&text), Some(MarketRegime::StrongBull));
    }

    #[test]
    fn trade_tier_round_trips_through_text() {
        let text = enum_to_text(&TradeTier::Blocked);
        assert_eq!(text, "BLOCKED");
        assert_eq!(text_to_enum::<TradeTier>(&text), Some(TradeTier::Blocked));
    }

    #[test]
    fn synthetic_trade_log_has_manual_sync_reason() {
        let log = synthetic_trade_log("005930", "Samsung Electronics", TradeType::Sell, 10.0, 70_000.0, Utc::now());
        assert_eq!(log.reason, "MANUAL_SYNC");
        assert_eq!(log.total_amount, 700_000.0);
    }
}
