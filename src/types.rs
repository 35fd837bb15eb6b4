// =============================================================================
// Shared types used across the control plane
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// A raw price tick as produced by the gateway's WebSocket ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub code: String,
    pub price: f64,
    pub high_of_day: f64,
    pub volume_delta: f64,
    pub server_timestamp: DateTime<Utc>,
}

/// One minute OHLCV bar produced by the Bar Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub code: String,
    pub bar_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Daily OHLCV candle, used for ATR/RSI/MA lookback computations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCandle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Broad market regime, sourced externally (scout/LLM pipeline) and cached
/// as part of the trading context. The control plane never computes this
/// itself; it is produced externally and only consumed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    StrongBull,
    Bull,
    Sideways,
    Bear,
    StrongBear,
}

impl MarketRegime {
    pub fn is_bearish(self) -> bool {
        matches!(self, Self::Bear | Self::StrongBear)
    }

    pub fn is_bull(self) -> bool {
        matches!(self, Self::StrongBull | Self::Bull)
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBull => "STRONG_BULL",
            Self::Bull => "BULL",
            Self::Sideways => "SIDEWAYS",
            Self::Bear => "BEAR",
            Self::StrongBear => "STRONG_BEAR",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VixRegime {
    Calm,
    Normal,
    Elevated,
    Crisis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeTier {
    Tier1,
    Tier2,
    Blocked,
}

impl TradeTier {
    /// Multiplicative weight applied during position sizing.
    pub fn size_multiplier(self) -> f64 {
        match self {
            Self::Tier1 => 1.0,
            Self::Tier2 => 0.5,
            Self::Blocked => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTag {
    Bullish,
    Neutral,
    Caution,
    DistributionRisk,
}

/// One entry in the externally-produced watchlist artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub code: String,
    pub name: String,
    pub hybrid_score: f64,
    pub llm_score: f64,
    pub trade_tier: TradeTier,
    pub risk_tag: RiskTag,
    pub sector: String,
    pub rank: u32,
    pub scored_at: DateTime<Utc>,
}

impl WatchlistEntry {
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.scored_at).num_days()
    }
}

/// Cached macro/regime artifact, produced externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub date: NaiveDate,
    pub market_regime: MarketRegime,
    pub position_multiplier: f64,
    pub stop_loss_multiplier: f64,
    pub vix_regime: VixRegime,
    pub risk_off_level: u8,
    pub favor_sectors: Vec<String>,
    pub avoid_sectors: Vec<String>,
}

impl Default for TradingContext {
    fn default() -> Self {
        Self {
            date: Utc::now().date_naive(),
            market_regime: MarketRegime::Sideways,
            position_multiplier: 1.0,
            stop_loss_multiplier: 1.0,
            vix_regime: VixRegime::Normal,
            risk_off_level: 0,
            favor_sectors: Vec::new(),
            avoid_sectors: Vec::new(),
        }
    }
}

/// Message published by the Signal Detector onto `stream:buy-signals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuySignal {
    pub code: String,
    pub name: String,
    pub signal_type: String,
    pub signal_price: f64,
    pub llm_score: f64,
    pub hybrid_score: f64,
    pub trade_tier: TradeTier,
    pub risk_tag: RiskTag,
    pub market_regime: MarketRegime,
    pub source: String,
    pub rsi: f64,
    pub volume_ratio: f64,
    pub vwap: f64,
    pub position_multiplier: f64,
    pub sector: String,
    pub timestamp: DateTime<Utc>,
}

/// Message published by the Position Monitor (or Sell Executor's own retry
/// path) onto `stream:sell-orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellOrder {
    pub code: String,
    pub name: String,
    pub sell_reason: String,
    pub current_price: f64,
    pub quantity: f64,
    pub buy_price: f64,
    pub profit_pct: f64,
    pub holding_days: i64,
    pub timestamp: DateTime<Utc>,
}

impl SellOrder {
    pub fn is_manual_override(&self) -> bool {
        matches!(self.sell_reason.as_str(), "MANUAL" | "FORCED_LIQUIDATION")
    }

    pub fn triggers_stoploss_cooldown(&self) -> bool {
        matches!(
            self.sell_reason.as_str(),
            "STOP_LOSS" | "DEATH_CROSS" | "BREAKEVEN_STOP"
        )
    }
}

/// A held position. Only the Buy/Sell executors and reconciliation mutate
/// this; the Monitor mutates only the dynamic-state fields via the cache
/// (watermark / scale_out_level / rsi_sold_flag / profit_floor_*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub code: String,
    pub name: String,
    pub quantity: f64,
    pub avg_buy_price: f64,
    pub total_buy_amount: f64,
    pub sector: String,
    pub high_watermark: f64,
    pub stop_loss_price: f64,
    pub bought_at: DateTime<Utc>,
    pub scale_out_level: u8,
    pub rsi_sold_flag: bool,
    pub profit_floor_active: bool,
    pub profit_floor_level: f64,
}

impl Position {
    pub fn holding_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.bought_at).num_days()
    }

    pub fn profit_pct(&self, price: f64) -> f64 {
        if self.avg_buy_price <= 0.0 {
            return 0.0;
        }
        (price - self.avg_buy_price) / self.avg_buy_price * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType {
    Buy,
    Sell,
}

/// Append-only trade record. Reconciliation writes synthetic rows with
/// `reason = "MANUAL_SYNC"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLog {
    pub id: uuid::Uuid,
    pub code: String,
    pub name: String,
    pub trade_type: TradeType,
    pub quantity: f64,
    pub price: f64,
    pub total_amount: f64,
    pub reason: String,
    pub strategy_signal: Option<String>,
    pub regime: Option<MarketRegime>,
    pub llm_score: Option<f64>,
    pub hybrid_score: Option<f64>,
    pub trade_tier: Option<TradeTier>,
    pub profit_pct: Option<f64>,
    pub profit_amount: Option<f64>,
    pub holding_days: Option<i64>,
    pub trade_timestamp: DateTime<Utc>,
}

/// Per-code dynamic state mirrored into the cache. This struct is the in-process
/// convenience view; the authoritative copy lives in Redis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicPositionState {
    pub watermark: Option<f64>,
    pub scale_out_level: Option<u8>,
    pub rsi_sold: Option<bool>,
    pub profit_floor_active: Option<bool>,
    pub profit_floor_level: Option<f64>,
    pub stoploss_cooldown: bool,
    pub sell_cooldown: bool,
}
