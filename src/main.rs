// =============================================================================
// KRX Control Plane — Main Entry Point
// =============================================================================
//
// Wires the Bar Engine, Signal Detector, Buy/Sell Executors, Position
// Monitor, Reconciliation, and the REST/WebSocket dashboard API around a
// shared `AppState`, all driven off four Redis Streams and a Postgres
// `positions`/`trade_logs` pair. Every long-running task is an independent
// `tokio::spawn`, matching the teacher's one-task-per-concern layout; the
// only barrier at shutdown is `ctrl_c`.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bar_engine;
mod broker;
mod bus;
mod buy_executor;
mod config;
mod correlation;
mod decision_log;
mod error;
mod gates;
mod indicators;
mod persistence;
mod portfolio_guard;
mod position_monitor;
mod position_sizing;
mod reconcile;
mod sell_executor;
mod signal_detector;
mod tick_size;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bar_engine::BarEngine;
use crate::broker::client::KisClient;
use crate::bus::{ConsumerGroup, HashCache, ScalarCache, StreamBus};
use crate::buy_executor::{BuyContext, BuyExecutor};
use crate::config::Config;
use crate::decision_log::{DecisionLog, DecisionSide};
use crate::persistence::{PositionRepository, TradeLogRepository};
use crate::position_monitor::{PositionContext, RefreshedAnalytics};
use crate::reconcile::Reconciler;
use crate::sell_executor::{SellContext, SellExecutor};
use crate::signal_detector::{DetectionInputs, DetectionOutcome, MomentumConfirmations};
use crate::types::{BuySignal, DailyCandle, SellOrder, TradeLog, TradeType, TradingContext, TradingMode, WatchlistEntry};

/// Per-code analytics refreshed once per `position_refresh_secs` cycle, shared
/// between the refresh loop and the per-tick Position Monitor pump.
type AnalyticsMap = Arc<RwLock<HashMap<String, RefreshedAnalytics>>>;

fn now_kst() -> (chrono::DateTime<Utc>, NaiveTime) {
    let now = Utc::now();
    let kst = now.with_timezone(&chrono_tz::Asia::Seoul);
    (now, kst.time())
}

async fn fetch_watchlist(cache: &ScalarCache) -> Vec<WatchlistEntry> {
    cache.get::<Vec<WatchlistEntry>>("watchlist:active").await.unwrap_or_default()
}

async fn fetch_trading_context(cache: &ScalarCache) -> TradingContext {
    cache.get::<TradingContext>("trading:context").await.unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        KRX Control Plane — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Config ─────────────────────────────────────────────────────────
    let config = Config::from_env()?;
    info!(dry_run = config.infra.dry_run, "engine starting (Paused until resumed via API)");

    // ── 2. Postgres ───────────────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    persistence::run_migrations(&pool).await?;
    let positions_repo = PositionRepository::new(pool.clone());
    let trade_logs_repo = TradeLogRepository::new(pool.clone());

    // ── 3. Redis — bus + caches ───────────────────────────────────────────
    let redis_client = redis::Client::open(config.redis.url.clone())?;
    let conn = redis_client.get_connection_manager().await?;

    let ticks_bus = StreamBus::new(conn.clone(), config.redis.ticks_stream.clone());
    let buy_signals_bus = StreamBus::new(conn.clone(), config.redis.buy_signals_stream.clone());
    let sell_orders_bus = StreamBus::new(conn.clone(), config.redis.sell_orders_stream.clone());
    let trade_notifications_bus = StreamBus::new(conn.clone(), config.redis.trade_notifications_stream.clone());

    let cache = ScalarCache::new(conn.clone());
    let hash_cache = HashCache::new(conn.clone());

    let consumer_name = format!("cp-{}", std::process::id());
    let mut ticks_group =
        ConsumerGroup::join(conn.clone(), config.redis.ticks_stream.clone(), "monitor-group", consumer_name.clone()).await?;
    let mut buy_group = ConsumerGroup::join(
        conn.clone(),
        config.redis.buy_signals_stream.clone(),
        "group_buy_executor",
        consumer_name.clone(),
    )
    .await?;
    let mut sell_group = ConsumerGroup::join(
        conn.clone(),
        config.redis.sell_orders_stream.clone(),
        "group_sell_executor",
        consumer_name.clone(),
    )
    .await?;

    for group in [&mut ticks_group, &mut buy_group, &mut sell_group] {
        match group.reclaim_pending().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "reclaimed idle pending entries at startup")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to reclaim pending entries at startup"),
        }
    }

    // ── 4. Broker client + Bar Engine ─────────────────────────────────────
    let broker = KisClient::new(
        config.kis.clone(),
        config.infra.circuit_breaker_failure_threshold,
        config.infra.circuit_breaker_reset_secs,
    );
    let bar_engine = Arc::new(BarEngine::new());

    // ── 5. Load positions, build shared state ─────────────────────────────
    let initial_positions = positions_repo.list_all().await?;
    let held_codes: Vec<String> = initial_positions.iter().map(|p| p.code.clone()).collect();

    let state = Arc::new(AppState::new(
        config.clone(),
        bar_engine.clone(),
        broker.clone(),
        cache.clone(),
        hash_cache.clone(),
        trade_notifications_bus.clone(),
        positions_repo.clone(),
        trade_logs_repo.clone(),
        initial_positions,
    ));

    // ── 6. Start the realtime tick ingester ───────────────────────────────
    let watchlist = fetch_watchlist(&cache).await;
    let mut initial_codes: Vec<String> = watchlist.iter().map(|w| w.code.clone()).collect();
    for code in &held_codes {
        if !initial_codes.contains(code) {
            initial_codes.push(code.clone());
        }
    }
    let ws_url = std::env::var("KIS_WS_URL").unwrap_or_else(|_| "wss://ops.koreainvestment.com:21000".to_string());
    let (sub_handle, _ws_handle) = broker::ws_ingester::run(config.kis.clone(), ws_url, ticks_bus.clone(), initial_codes).await;

    // ── 7. REST + WebSocket API server ────────────────────────────────────
    let bind_addr = std::env::var("KRX_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    {
        let api_state = state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    // ── 8. Bar Engine pump + Signal Detector + Position Monitor (ticks) ───
    let analytics: AnalyticsMap = Arc::new(RwLock::new(HashMap::new()));
    let momentum = Arc::new(MomentumConfirmations::new());
    {
        let state = state.clone();
        let analytics = analytics.clone();
        let momentum = momentum.clone();
        let bar_engine = bar_engine.clone();
        let mut group = ticks_group;
        let sell_orders_bus = sell_orders_bus.clone();
        let buy_signals_bus = buy_signals_bus.clone();
        tokio::spawn(async move {
            run_ticks_pump(state, bar_engine, &mut group, analytics, momentum, sell_orders_bus, buy_signals_bus).await;
        });
    }

    // ── 9. Buy signal consumer → Buy Executor ─────────────────────────────
    {
        let state = state.clone();
        let mut group = buy_group;
        tokio::spawn(async move {
            run_buy_pump(state, &mut group).await;
        });
    }

    // ── 10. Sell order consumer → Sell Executor ───────────────────────────
    {
        let state = state.clone();
        let mut group = sell_group;
        tokio::spawn(async move {
            run_sell_pump(state, &mut group).await;
        });
    }

    // ── 11. Position analytics refresh loop (300s) ────────────────────────
    {
        let state = state.clone();
        let analytics = analytics.clone();
        let sub_handle = sub_handle.clone();
        tokio::spawn(async move {
            run_refresh_loop(state, analytics, sub_handle).await;
        });
    }

    // ── 12. Reconciliation loop ────────────────────────────────────────────
    {
        let state = state.clone();
        let reconciler = Reconciler::new(broker.clone(), positions_repo.clone(), trade_logs_repo.clone());
        let interval_secs = config.infra.reconcile_interval_secs;
        tokio::spawn(async move {
            run_reconcile_loop(state, reconciler, interval_secs).await;
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 13. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    info!("KRX control plane shut down complete");
    Ok(())
}

// =============================================================================
// Ticks pump — Bar Engine ingestion, Signal Detector on bar close, Position
// Monitor on every tick.
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_ticks_pump(
    state: Arc<AppState>,
    bar_engine: Arc<BarEngine>,
    group: &mut ConsumerGroup,
    analytics: AnalyticsMap,
    momentum: Arc<MomentumConfirmations>,
    sell_orders_bus: StreamBus,
    buy_signals_bus: StreamBus,
) {
    loop {
        let messages = match group.read(2_000, 50).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "tick stream read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        for msg in messages {
            // Pre-ack: a handler panic or crash never causes duplicate bar
            // ingestion or a doubled sell signal.
            if let Err(e) = group.ack(&msg.id).await {
                warn!(error = %e, "failed to ack tick message");
            }
            let Some(tick) = group.decode::<crate::types::Tick>(&msg) else { continue };

            let bars_before = bar_engine.bar_count(&tick.code);
            bar_engine.ingest(&tick);
            let bars_after = bar_engine.bar_count(&tick.code);

            evaluate_position_exit(&state, &tick.code, tick.price, &analytics, &sell_orders_bus).await;

            if bars_after > bars_before {
                scan_for_signal(&state, &bar_engine, &tick.code, &momentum, &buy_signals_bus).await;
            }
        }
    }
}

/// Per-tick exit evaluation for a held position. A no-op if the code isn't
/// held or the once-per-refresh analytics haven't landed yet.
async fn evaluate_position_exit(state: &Arc<AppState>, code: &str, price: f64, analytics: &AnalyticsMap, sell_orders_bus: &StreamBus) {
    let Some(position) = state.positions.read().get(code).cloned() else { return };
    let Some(refreshed) = analytics.read().get(code).copied() else { return };

    let new_watermark = position.high_watermark.max(price);
    let mut position = position;
    if new_watermark > position.high_watermark {
        position.high_watermark = new_watermark;
        state.upsert_position(position.clone());
        let _ = state.positions_repo.bump_watermark(code, new_watermark).await;
    }

    let dynamic = state.dynamic_state.read().get(code).cloned().unwrap_or_default();
    let context = fetch_trading_context(&state.cache).await;
    let (now, _) = now_kst();

    let ctx = PositionContext {
        position: &position,
        price,
        watermark: new_watermark,
        high_profit_pct: position.profit_pct(new_watermark),
        analytics: refreshed,
        holding_days: position.holding_days(now),
        scale_out_level: dynamic.scale_out_level.unwrap_or(position.scale_out_level),
        rsi_sold_flag: dynamic.rsi_sold.unwrap_or(position.rsi_sold_flag),
        regime: context.market_regime,
        now,
    };

    let Some(exit) = position_monitor::evaluate(&ctx, &state.config.sell) else { return };

    let cooldown_key = format!("cooldown:sell-signal:{code}:{}", exit.reason);
    if state.cache.exists(&cooldown_key).await {
        return;
    }
    state.cache.set(&cooldown_key, &true, Some(15)).await;

    let order = position_monitor::build_sell_order(&ctx, exit);
    match sell_orders_bus.publish(&order).await {
        Ok(_) => {
            state.push_decision(DecisionLog::allowed(code, DecisionSide::Sell, exit.reason));
            info!(code, reason = exit.reason, "sell order published");
        }
        Err(e) => {
            state.push_error_with_code(format!("failed to publish sell order for {code}: {e}"), Some("SELL_PUBLISH_FAIL".to_string()));
        }
    }
}

/// Run the Signal Detector for `code` if it's still on the active watchlist.
async fn scan_for_signal(state: &Arc<AppState>, bar_engine: &BarEngine, code: &str, momentum: &MomentumConfirmations, buy_signals_bus: &StreamBus) {
    if state.positions.read().contains_key(code) {
        return; // already held — the Buy Executor short-circuits on this anyway, skip the round-trip.
    }

    let watchlist = fetch_watchlist(&state.cache).await;
    let Some(entry) = watchlist.iter().find(|w| w.code == code) else { return };
    let context = fetch_trading_context(&state.cache).await;

    let daily_candles = state.broker.daily_prices(code, 60).await.unwrap_or_default();
    let cooldown_remaining_secs = state.cache.ttl(&format!("cooldown:signal:{code}")).await;
    let dynamic = state.dynamic_state.read().get(code).cloned().unwrap_or_default();
    let (now, now_kst) = now_kst();

    let input = DetectionInputs {
        watchlist: entry,
        context: &context,
        daily_candles: &daily_candles,
        cooldown_remaining_secs,
        stoploss_cooldown_active: dynamic.stoploss_cooldown,
        sell_cooldown_active: dynamic.sell_cooldown,
        now,
        now_kst,
    };

    match signal_detector::detect(bar_engine, &input, &state.config.scanner, &state.config.risk, momentum) {
        DetectionOutcome::Signal(signal) => {
            state.cache.set(&format!("cooldown:signal:{code}"), &true, Some(state.config.scanner.signal_cooldown_secs as u64)).await;
            match buy_signals_bus.publish(&signal).await {
                Ok(_) => {
                    state.push_decision(DecisionLog::allowed(code, DecisionSide::Buy, signal.signal_type.clone()));
                    info!(code, signal_type = %signal.signal_type, "buy signal published");
                }
                Err(e) => {
                    state.push_error_with_code(format!("failed to publish buy signal for {code}: {e}"), Some("BUY_SIGNAL_PUBLISH_FAIL".to_string()));
                }
            }
        }
        DetectionOutcome::GateRejected(rejection) => {
            state.push_decision(DecisionLog::skipped(code, DecisionSide::Buy, "gate", format!("{rejection:?}")));
        }
        DetectionOutcome::NoStrategyMatch => {}
    }
}

// =============================================================================
// Buy signal consumer → Buy Executor
// =============================================================================

async fn run_buy_pump(state: Arc<AppState>, group: &mut ConsumerGroup) {
    let executor = BuyExecutor::new(state.broker.clone(), state.cache.clone(), state.config.clone());

    loop {
        let messages = match group.read(2_000, 20).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "buy signal stream read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        for msg in messages {
            if let Err(e) = group.ack(&msg.id).await {
                warn!(error = %e, "failed to ack buy signal message");
            }
            let Some(signal) = group.decode::<BuySignal>(&msg) else { continue };
            handle_buy_signal(&state, &executor, signal).await;
        }
    }
}

async fn handle_buy_signal(state: &Arc<AppState>, executor: &BuyExecutor, signal: BuySignal) {
    let code = signal.code.clone();
    let today = Utc::now().date_naive();

    let already_holding = state.positions.read().contains_key(&code);
    let portfolio_size = state.positions.read().len() as u32;
    let today_buy_count = state
        .recent_trade_logs
        .read()
        .iter()
        .filter(|l| l.trade_type == TradeType::Buy && l.code == code && l.trade_timestamp.date_naive() == today)
        .count() as u32;

    let held_codes: Vec<String> = state.positions.read().keys().cloned().collect();
    let mut held_candles: Vec<(String, Vec<DailyCandle>)> = Vec::new();
    for held_code in &held_codes {
        if held_code == &code {
            continue;
        }
        let candles = state.broker.daily_prices(held_code, 60).await.unwrap_or_default();
        held_candles.push((held_code.clone(), candles));
    }
    let held_daily_candles: Vec<(&str, &[DailyCandle])> = held_candles.iter().map(|(c, d)| (c.as_str(), d.as_slice())).collect();

    let daily_candles = state.broker.daily_prices(&code, 60).await.unwrap_or_default();

    let balance = match state.broker.balance().await {
        Ok(b) => b,
        Err(e) => {
            state.push_decision(DecisionLog::skipped(&code, DecisionSide::Buy, &signal.signal_type, format!("balance fetch failed: {e}")));
            return;
        }
    };

    let mut sector_stock_counts: HashMap<String, u32> = HashMap::new();
    let mut sector_value: HashMap<String, f64> = HashMap::new();
    let mut total_position_value = 0.0;
    {
        let positions = state.positions.read();
        for p in positions.values() {
            *sector_stock_counts.entry(p.sector.clone()).or_insert(0) += 1;
            *sector_value.entry(p.sector.clone()).or_insert(0.0) += p.total_buy_amount;
            total_position_value += p.total_buy_amount;
        }
    }
    let sector_already_held = sector_stock_counts.contains_key(&signal.sector);

    let watchlist = fetch_watchlist(&state.cache).await;
    let watchlist_age_days = watchlist.iter().find(|w| w.code == code).map(|w| w.age_days(Utc::now())).unwrap_or(0);
    let dynamic = state.dynamic_state.read().get(&code).cloned().unwrap_or_default();

    let ctx = BuyContext {
        trading_mode: *state.trading_mode.read(),
        already_holding,
        stoploss_cooldown_active: dynamic.stoploss_cooldown,
        sell_cooldown_active: dynamic.sell_cooldown,
        today_buy_count,
        portfolio_size,
        daily_candles: &daily_candles,
        held_daily_candles: &held_daily_candles,
        sector_stock_counts: &sector_stock_counts,
        sector_value: &sector_value,
        total_position_value,
        cash: balance.cash,
        total_assets: balance.total,
        current_portfolio_heat_pct: if balance.total > 0.0 { total_position_value / balance.total * 100.0 } else { 0.0 },
        sector_already_held,
        watchlist_age_days,
        sector_cap: None,
    };

    match executor.execute(&signal, &ctx).await {
        Ok(Some(outcome)) => {
            state.upsert_position(outcome.position.clone());
            if let Err(e) = state.positions_repo.upsert(&outcome.position).await {
                state.push_error_with_code(format!("failed to persist new position {code}: {e}"), Some("POSITION_WRITE_FAIL".to_string()));
            }
            let log = TradeLog {
                id: uuid::Uuid::new_v4(),
                code: code.clone(),
                name: signal.name.clone(),
                trade_type: TradeType::Buy,
                quantity: outcome.quantity,
                price: outcome.fill_price,
                total_amount: outcome.fill_price * outcome.quantity,
                reason: signal.signal_type.clone(),
                strategy_signal: Some(signal.signal_type.clone()),
                regime: Some(signal.market_regime),
                llm_score: Some(signal.llm_score),
                hybrid_score: Some(signal.hybrid_score),
                trade_tier: Some(signal.trade_tier),
                profit_pct: Some(0.0),
                profit_amount: Some(0.0),
                holding_days: Some(0),
                trade_timestamp: Utc::now(),
            };
            state.record_trade_log(log.clone()).await;
            let _ = state.stream.publish(&log).await;
            state.push_decision(DecisionLog::allowed(&code, DecisionSide::Buy, signal.signal_type.clone()));
            info!(code, price = outcome.fill_price, quantity = outcome.quantity, "buy executed");
        }
        Ok(None) => {
            state.push_decision(DecisionLog::skipped(&code, DecisionSide::Buy, &signal.signal_type, "not filled within momentum timeout"));
        }
        Err(skip) => {
            state.push_decision(DecisionLog::skipped(&code, DecisionSide::Buy, &signal.signal_type, format!("{skip:?}")));
        }
    }
}

// =============================================================================
// Sell order consumer → Sell Executor
// =============================================================================

async fn run_sell_pump(state: Arc<AppState>, group: &mut ConsumerGroup) {
    let executor = SellExecutor::new(state.broker.clone(), state.cache.clone(), state.config.clone());

    loop {
        let messages = match group.read(2_000, 20).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "sell order stream read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        for msg in messages {
            if let Err(e) = group.ack(&msg.id).await {
                warn!(error = %e, "failed to ack sell order message");
            }
            let Some(order) = group.decode::<SellOrder>(&msg) else { continue };
            handle_sell_order(&state, &executor, order).await;
        }
    }
}

async fn handle_sell_order(state: &Arc<AppState>, executor: &SellExecutor, order: SellOrder) {
    let code = order.code.clone();
    let Some(position) = state.positions.read().get(&code).cloned() else {
        state.push_decision(DecisionLog::skipped(&code, DecisionSide::Sell, &order.sell_reason, "not holding"));
        return;
    };

    let (_, now_kst_time) = now_kst();
    let emergency_stop = *state.trading_mode.read() == TradingMode::Killed;
    let ctx = SellContext {
        emergency_stop,
        now_kst: now_kst_time,
        held_quantity: position.quantity,
        avg_buy_price: position.avg_buy_price,
    };

    match executor.execute(&order, &ctx).await {
        Ok(Some(outcome)) => {
            if outcome.full_exit {
                state.remove_position(&code);
                if let Err(e) = state.positions_repo.delete(&code).await {
                    state.push_error_with_code(format!("failed to delete closed position {code}: {e}"), Some("POSITION_DELETE_FAIL".to_string()));
                }
            } else {
                let mut updated = position.clone();
                updated.quantity -= outcome.filled_qty;
                updated.scale_out_level = updated.scale_out_level.saturating_add(1);
                state.upsert_position(updated.clone());
                if let Err(e) = state.positions_repo.upsert(&updated).await {
                    state.push_error_with_code(format!("failed to persist scaled-out position {code}: {e}"), Some("POSITION_WRITE_FAIL".to_string()));
                }
            }

            if outcome.set_stoploss_cooldown {
                let ttl = (state.config.risk.stoploss_cooldown_days * 86_400).max(0) as u64;
                state.cache.set(&format!("cooldown:stoploss:{code}"), &true, Some(ttl)).await;
            }
            if outcome.set_sell_cooldown {
                let ttl = (state.config.risk.sell_cooldown_hours * 3_600).max(0) as u64;
                state.cache.set(&format!("cooldown:sell:{code}"), &true, Some(ttl)).await;
            }
            {
                let mut dynamic = state.dynamic_state.write();
                let entry = dynamic.entry(code.clone()).or_default();
                entry.stoploss_cooldown = outcome.set_stoploss_cooldown || entry.stoploss_cooldown;
                entry.sell_cooldown = outcome.set_sell_cooldown || entry.sell_cooldown;
                if order.sell_reason == "RSI_OVERBOUGHT" {
                    entry.rsi_sold = Some(true);
                }
            }

            let log = TradeLog {
                id: uuid::Uuid::new_v4(),
                code: code.clone(),
                name: order.name.clone(),
                trade_type: TradeType::Sell,
                quantity: outcome.filled_qty,
                price: outcome.fill_price,
                total_amount: outcome.fill_price * outcome.filled_qty,
                reason: order.sell_reason.clone(),
                strategy_signal: Some(order.sell_reason.clone()),
                regime: None,
                llm_score: None,
                hybrid_score: None,
                trade_tier: None,
                profit_pct: Some(outcome.profit_pct),
                profit_amount: Some((outcome.fill_price - position.avg_buy_price) * outcome.filled_qty),
                holding_days: Some(order.holding_days),
                trade_timestamp: Utc::now(),
            };
            state.record_trade_log(log.clone()).await;
            let _ = state.stream.publish(&log).await;
            state.push_decision(DecisionLog::allowed(&code, DecisionSide::Sell, order.sell_reason.clone()));
            info!(code, reason = %order.sell_reason, price = outcome.fill_price, qty = outcome.filled_qty, "sell executed");
        }
        Ok(None) => {
            state.push_decision(DecisionLog::skipped(&code, DecisionSide::Sell, &order.sell_reason, "not filled"));
        }
        Err(skip) => {
            state.push_decision(DecisionLog::skipped(&code, DecisionSide::Sell, &order.sell_reason, format!("{skip:?}")));
        }
    }
}

// =============================================================================
// Position analytics refresh loop — recomputes ATR/RSI/death-cross once per
// cycle so the per-tick hot path never touches the daily-candle endpoint.
// =============================================================================

async fn run_refresh_loop(state: Arc<AppState>, analytics: AnalyticsMap, sub_handle: broker::ws_ingester::SubscriptionHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(state.config.infra.position_refresh_secs));
    loop {
        interval.tick().await;

        let codes: Vec<String> = state.positions.read().keys().cloned().collect();
        for code in &codes {
            sub_handle.subscribe(code.clone());
            let price = match state.broker.snapshot(code).await {
                Ok(s) if s.price > 0.0 => s.price,
                _ => continue,
            };
            let candles = match state.broker.daily_prices(code, 60).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(code, error = %e, "failed to refresh daily candles");
                    continue;
                }
            };
            let refreshed = position_monitor::refresh_analytics(&candles, price);
            analytics.write().insert(code.clone(), refreshed);
        }

        // Also refresh the active watchlist's subscriptions, so a newly
        // promoted code starts streaming without a restart.
        let watchlist = fetch_watchlist(&state.cache).await;
        for entry in &watchlist {
            sub_handle.subscribe(entry.code.clone());
        }
    }
}

// =============================================================================
// Reconciliation loop
// =============================================================================

async fn run_reconcile_loop(state: Arc<AppState>, reconciler: Reconciler, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let skip_counter = AtomicU32::new(0);
    loop {
        interval.tick().await;
        match reconciler.reconcile_once().await {
            Ok(report) => {
                state.record_reconcile_ok();
                if !report.actions.is_empty() {
                    for action in &report.actions {
                        info!(action, "reconciliation action applied");
                    }
                }
                match state.positions_repo.list_all().await {
                    Ok(refreshed) => {
                        let mut positions = state.positions.write();
                        positions.clear();
                        for p in refreshed {
                            positions.insert(p.code.clone(), p);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to refresh in-memory positions after reconciliation"),
                }
                state.increment_version();
            }
            Err(e) => {
                skip_counter.fetch_add(1, Ordering::Relaxed);
                state.record_reconcile_error(format!("{e}"));
                state.push_error_with_code(format!("reconciliation failed: {e}"), Some("RECONCILE_FAIL".to_string()));
                error!(error = %e, "reconciliation failed");
            }
        }
    }
}
