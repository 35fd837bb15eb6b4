// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth shared by the REST API and every background
// task: bar engine, broker client, bus handles, and an in-memory mirror of
// the `positions` table that the executors and reconciliation job keep in
// sync with Postgres. All mutable collections are `parking_lot::RwLock`;
// a monotonically increasing version counter lets the WebSocket feed detect
// changes without diffing the snapshot itself.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bar_engine::BarEngine;
use crate::broker::client::KisClient;
use crate::bus::{HashCache, ScalarCache, StreamBus};
use crate::config::Config;
use crate::decision_log::DecisionLog;
use crate::persistence::{PositionRepository, TradeLogRepository};
use crate::types::{DynamicPositionState, Position, TradeLog, TradingMode};

/// A recorded error event for the operator-facing error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_TRADE_LOGS: usize = 100;
const MAX_RECENT_DECISIONS: usize = 200;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: Config,

    pub bar_engine: Arc<BarEngine>,
    pub broker: KisClient,
    pub cache: ScalarCache,
    pub hash_cache: HashCache,
    pub stream: StreamBus,
    pub positions_repo: PositionRepository,
    pub trade_logs_repo: TradeLogRepository,

    /// In-memory mirror of `positions`, refreshed at startup and kept live by
    /// the executors and the reconciliation job.
    pub positions: RwLock<HashMap<String, Position>>,
    /// Per-code dynamic state mirror (the authoritative copy lives in Redis;
    /// this is only for the dashboard snapshot).
    pub dynamic_state: RwLock<HashMap<String, DynamicPositionState>>,

    pub trading_mode: RwLock<TradingMode>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub recent_trade_logs: RwLock<Vec<TradeLog>>,
    pub recent_decisions: RwLock<Vec<DecisionLog>>,

    pub last_reconcile_ok: RwLock<Option<Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        bar_engine: Arc<BarEngine>,
        broker: KisClient,
        cache: ScalarCache,
        hash_cache: HashCache,
        stream: StreamBus,
        positions_repo: PositionRepository,
        trade_logs_repo: TradeLogRepository,
        initial_positions: Vec<Position>,
    ) -> Self {
        let positions = initial_positions.into_iter().map(|p| (p.code.clone(), p)).collect();

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config,
            bar_engine,
            broker,
            cache,
            hash_cache,
            stream,
            positions_repo,
            trade_logs_repo,
            positions: RwLock::new(positions),
            dynamic_state: RwLock::new(HashMap::new()),
            trading_mode: RwLock::new(TradingMode::default()),
            recent_errors: RwLock::new(Vec::new()),
            recent_trade_logs: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            start_time: Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord { message: msg, code, at: Utc::now().to_rfc3339() };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Record a trade log both in the ring buffer (for the dashboard) and in
    /// Postgres (the durable record).
    pub async fn record_trade_log(&self, log: TradeLog) {
        if let Err(e) = self.trade_logs_repo.insert(&log).await {
            self.push_error_with_code(
                format!("failed to persist trade log for {}: {e}", log.code),
                Some("TRADE_LOG_WRITE_FAIL".to_string()),
            );
        }
        let mut logs = self.recent_trade_logs.write();
        logs.push(log);
        while logs.len() > MAX_RECENT_TRADE_LOGS {
            logs.remove(0);
        }
        self.increment_version();
    }

    /// Record a decision log entry in the ring buffer only — unlike trade
    /// logs these are not durable, they exist purely for the dashboard.
    pub fn push_decision(&self, decision: DecisionLog) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    pub fn upsert_position(&self, position: Position) {
        self.positions.write().insert(position.code.clone(), position);
        self.increment_version();
    }

    pub fn remove_position(&self, code: &str) {
        self.positions.write().remove(code);
        self.dynamic_state.write().remove(code);
        self.increment_version();
    }

    pub fn record_reconcile_ok(&self) {
        *self.last_reconcile_ok.write() = Some(Instant::now());
        *self.last_reconcile_error.write() = None;
        self.increment_version();
    }

    pub fn record_reconcile_error(&self, msg: String) {
        *self.last_reconcile_error.write() = Some(msg);
        self.increment_version();
    }

    /// Build a complete, serialisable snapshot of the engine state for the
    /// REST `/api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let version = self.current_state_version();

        let ws_user_event_age_ms = self.last_ws_user_event.read().elapsed().as_millis() as u64;
        let reconcile_last_ok_age_s = self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs());

        let truth = TruthHeader {
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: ws_user_event_age_ms,
            reconcile_last_ok_age_s,
            reconcile_last_error: self.last_reconcile_error.read().clone(),
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_mode: self.trading_mode.read().to_string(),
            server_time: now.timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        let positions: Vec<Position> = self.positions.read().values().cloned().collect();
        let recent_trade_logs = self.recent_trade_logs.read().clone();
        let recent_errors = self.recent_errors.read().clone();
        let recent_decisions = self.recent_decisions.read().clone();

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            positions,
            recent_trade_logs,
            recent_errors,
            recent_decisions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub positions: Vec<Position>,
    pub recent_trade_logs: Vec<TradeLog>,
    pub recent_errors: Vec<ErrorRecord>,
    pub recent_decisions: Vec<DecisionLog>,
}

/// Operational status header — the dashboard's primary status banner.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub reconcile_last_ok_age_s: Option<u64>,
    pub reconcile_last_error: Option<String>,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_mode: String,
    pub server_time: i64,
    pub uptime_seconds: u64,
}
