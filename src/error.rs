// =============================================================================
// Typed errors at the boundaries — broker, bus, gate rejections
// =============================================================================
//
// Internal plumbing (cache, config, Redis wiring) still uses `anyhow::Result`
// with `.context(...)` breadcrumbs, exactly as the rest of this codebase
// does. These enums exist specifically where a caller needs to *match* on
// the failure to decide what to do next (circuit-open vs validation error
// vs lock contention), per the Result{ok|err} envelope called for across
// the executor pipelines.
// =============================================================================

use thiserror::Error;

/// Error returned by a KIS broker API call.
#[derive(Debug, Clone, Error)]
#[error("broker error rt_cd={rt_code} msg_cd={msg_code}: {message}")]
pub struct BrokerError {
    pub rt_code: String,
    pub msg_code: String,
    pub message: String,
}

impl BrokerError {
    pub fn new(rt_code: impl Into<String>, msg_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rt_code: rt_code.into(),
            msg_code: msg_code.into(),
            message: message.into(),
        }
    }
}

/// Top-level failure mode for any call that goes through the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("circuit breaker open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    #[error("rate limited")]
    RateLimited,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a risk gate, guard, or lock rejected an otherwise-valid candidate.
///
/// Every variant carries enough context to become a human-readable skip
/// reason without re-deriving it at the call site.
#[derive(Debug, Clone, Error)]
pub enum GateRejection {
    #[error("below minimum bar count ({have}/{need})")]
    InsufficientBars { have: usize, need: usize },
    #[error("inside no-trade window")]
    NoTradeWindow,
    #[error("inside danger zone window")]
    DangerZone,
    #[error("RSI {rsi:.1} exceeds cap {cap:.1}")]
    RsiGuard { rsi: f64, cap: f64 },
    #[error("macro risk-off (level {level}, vix={vix})")]
    MacroRiskOff { level: u8, vix: String },
    #[error("market regime {regime} blocks entries")]
    MarketRegime { regime: String },
    #[error("combined risk: volume_ratio={volume_ratio:.2} price_over_vwap={price_over_vwap:.3}")]
    CombinedRisk { volume_ratio: f64, price_over_vwap: f64 },
    #[error("per-code cooldown active, {remaining_secs}s remaining")]
    Cooldown { remaining_secs: i64 },
    #[error("stoploss cooldown active")]
    StoplossCooldown,
    #[error("sell cooldown active")]
    SellCooldown,
    #[error("trade tier is BLOCKED")]
    TradeTierBlocked,
    #[error("micro-timing pattern: {pattern}")]
    MicroTiming { pattern: String },
}

/// Why a buy/sell executor short-circuited before even reaching the broker.
#[derive(Debug, Clone, Error)]
pub enum ExecutorSkip {
    #[error("emergency stop engaged")]
    EmergencyStop,
    #[error("trade tier BLOCKED")]
    TierBlocked,
    #[error("hybrid score {score:.1} below hard floor {floor:.1}")]
    BelowHardFloor { score: f64, floor: f64 },
    #[error("already holding this code")]
    AlreadyHolding,
    #[error("cooldown active: {0}")]
    Cooldown(String),
    #[error("daily buy limit reached ({count}/{max})")]
    DailyBuyLimit { count: u32, max: u32 },
    #[error("portfolio size at cap ({count}/{max})")]
    PortfolioFull { count: u32, max: u32 },
    #[error("lock contention on {key}")]
    LockContention { key: String },
    #[error("not holding this code")]
    NotHolding,
    #[error("quantity is zero after clamping")]
    ZeroQuantity,
    #[error("portfolio guard: {0}")]
    PortfolioGuard(String),
    #[error("correlation guard: {0}")]
    CorrelationGuard(String),
    #[error("position sizing yielded zero shares: {0}")]
    ZeroSizing(String),
}

/// Outcome of an order placement + confirmation-polling sequence.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    Filled { avg_price: f64, filled_qty: f64 },
    NotFilledCancelled,
    DryRun { synthetic_order_no: String },
}
