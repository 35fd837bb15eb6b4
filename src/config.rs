// =============================================================================
// Policy & Config — typed configuration tree loaded once from the environment
// =============================================================================
//
// Assembled once at process start from environment variables grouped by
// prefix and read-only thereafter — credentials have
// no business living in a checked-in JSON file. Every field falls back to a
// sane default so a sparsely-populated environment (e.g. local dev with only
// DB_/REDIS_ set) still produces a fully-populated config.
// =============================================================================

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use tracing::info;

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub ticks_stream: String,
    pub buy_signals_stream: String,
    pub sell_orders_stream: String,
    pub trade_notifications_stream: String,
}

#[derive(Debug, Clone)]
pub struct KisConfig {
    pub app_key: String,
    pub app_secret: String,
    pub base_url: String,
    pub account_no: String,
    pub token_path: String,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub hard_floor: f64,
    pub max_buy_count_per_day: u32,
    pub max_portfolio_size: u32,
    pub correlation_block_threshold: f64,
    pub portfolio_heat_limit_pct: f64,
    pub max_position_pct_default: f64,
    pub max_position_pct_a_plus: f64,
    pub llm_score_a_plus_threshold: f64,
    pub sector_risk_multiplier: f64,
    pub cash_keep_pct: f64,
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub max_sector_stocks_default: u32,
    pub max_sector_value_pct: f64,
    pub max_stock_value_pct: f64,
    /// Regime-indexed cash floor after a purchase: STRONG_BULL, BULL,
    /// SIDEWAYS, BEAR/STRONG_BEAR.
    pub cash_floor_by_regime: HashMap<String, f64>,
    pub stoploss_cooldown_days: i64,
    pub sell_cooldown_hours: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let mut cash_floor_by_regime = HashMap::new();
        cash_floor_by_regime.insert("STRONG_BULL".to_string(), 5.0);
        cash_floor_by_regime.insert("BULL".to_string(), 10.0);
        cash_floor_by_regime.insert("SIDEWAYS".to_string(), 15.0);
        cash_floor_by_regime.insert("BEAR".to_string(), 25.0);
        cash_floor_by_regime.insert("STRONG_BEAR".to_string(), 25.0);

        Self {
            hard_floor: 40.0,
            max_buy_count_per_day: 10,
            max_portfolio_size: 20,
            correlation_block_threshold: 0.85,
            portfolio_heat_limit_pct: 5.0,
            max_position_pct_default: 12.0,
            max_position_pct_a_plus: 18.0,
            llm_score_a_plus_threshold: 80.0,
            sector_risk_multiplier: 0.7,
            cash_keep_pct: 10.0,
            min_quantity: 1.0,
            max_quantity: 10_000.0,
            max_sector_stocks_default: 3,
            max_sector_value_pct: 25.0,
            max_stock_value_pct: 15.0,
            cash_floor_by_regime,
            stoploss_cooldown_days: 3,
            sell_cooldown_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub min_bars: usize,
    pub no_trade_window_start: &'static str,
    pub no_trade_window_end: &'static str,
    pub danger_zone_start: &'static str,
    pub danger_zone_end: &'static str,
    pub rsi_cap_default: f64,
    pub rsi_cap_bull: f64,
    pub signal_cooldown_secs: i64,
    pub momentum_confirmation_bars: u32,
    pub conviction_min_hybrid: f64,
    pub conviction_min_llm: f64,
    pub conviction_window_start: &'static str,
    pub conviction_window_end: &'static str,
    pub conviction_max_gain_pct: f64,
    pub conviction_max_age_days: i64,
    pub conviction_vwap_band_pct: f64,
    pub conviction_rsi_max: f64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_bars: 20,
            no_trade_window_start: "09:00",
            no_trade_window_end: "09:15",
            danger_zone_start: "14:00",
            danger_zone_end: "15:00",
            rsi_cap_default: 75.0,
            rsi_cap_bull: 85.0,
            signal_cooldown_secs: 600,
            momentum_confirmation_bars: 1,
            conviction_min_hybrid: 70.0,
            conviction_min_llm: 72.0,
            conviction_window_start: "09:15",
            conviction_window_end: "10:30",
            conviction_max_gain_pct: 3.0,
            conviction_max_age_days: 2,
            conviction_vwap_band_pct: 1.5,
            conviction_rsi_max: 65.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SellConfig {
    pub hard_stop_pct: f64,
    pub profit_lock_l2_activation_pct: f64,
    pub profit_lock_l2_floor_pct: f64,
    pub profit_lock_l1_activation_pct: f64,
    pub profit_lock_l1_floor_pct: f64,
    pub fixed_stop_loss_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_min_profit_pct: f64,
    pub profit_target_pct: f64,
    pub rsi_overbought_threshold: f64,
    pub rsi_overbought_min_profit_pct: f64,
    pub profit_floor_activation_pct: f64,
    pub profit_floor_level_pct: f64,
    pub market_open: &'static str,
    pub market_close: &'static str,
    pub confirm_max_retries: u32,
    pub confirm_poll_interval_secs: u64,
    /// Multiplier applied to the ATR trailing-stop and fixed-stop distances,
    /// keyed by `MarketRegime::to_string()` — tighter in risk-off regimes.
    pub macro_stop_mult_by_regime: HashMap<String, f64>,
    /// Trailing take-profit giveback, as a fraction of the watermark high,
    /// keyed by regime — tighter in STRONG_BULL, looser in BEAR.
    pub trailing_drop_by_regime: HashMap<String, f64>,
    /// Ascending scale-out profit thresholds (L0..L3), keyed by regime.
    pub scale_out_levels_by_regime: HashMap<String, Vec<f64>>,
    /// Maximum holding days before a time exit fires, keyed by regime.
    pub regime_max_days: HashMap<String, i64>,
}

impl Default for SellConfig {
    fn default() -> Self {
        let mut macro_stop_mult_by_regime = HashMap::new();
        macro_stop_mult_by_regime.insert("STRONG_BULL".to_string(), 1.2);
        macro_stop_mult_by_regime.insert("BULL".to_string(), 1.1);
        macro_stop_mult_by_regime.insert("SIDEWAYS".to_string(), 1.0);
        macro_stop_mult_by_regime.insert("BEAR".to_string(), 0.8);
        macro_stop_mult_by_regime.insert("STRONG_BEAR".to_string(), 0.7);

        let mut trailing_drop_by_regime = HashMap::new();
        trailing_drop_by_regime.insert("STRONG_BULL".to_string(), 0.02);
        trailing_drop_by_regime.insert("BULL".to_string(), 0.025);
        trailing_drop_by_regime.insert("SIDEWAYS".to_string(), 0.03);
        trailing_drop_by_regime.insert("BEAR".to_string(), 0.04);
        trailing_drop_by_regime.insert("STRONG_BEAR".to_string(), 0.05);

        let mut scale_out_levels_by_regime = HashMap::new();
        scale_out_levels_by_regime.insert("STRONG_BULL".to_string(), vec![5.0, 10.0, 16.0, 22.0]);
        scale_out_levels_by_regime.insert("BULL".to_string(), vec![4.0, 8.0, 14.0, 20.0]);
        scale_out_levels_by_regime.insert("SIDEWAYS".to_string(), vec![3.0, 7.0, 12.0, 18.0]);
        scale_out_levels_by_regime.insert("BEAR".to_string(), vec![2.0, 5.0, 9.0, 14.0]);
        scale_out_levels_by_regime.insert("STRONG_BEAR".to_string(), vec![2.0, 4.0, 7.0, 11.0]);

        let mut regime_max_days = HashMap::new();
        regime_max_days.insert("STRONG_BULL".to_string(), 20);
        regime_max_days.insert("BULL".to_string(), 20);
        regime_max_days.insert("SIDEWAYS".to_string(), 35);
        regime_max_days.insert("BEAR".to_string(), 35);
        regime_max_days.insert("STRONG_BEAR".to_string(), 35);

        Self {
            hard_stop_pct: -10.0,
            profit_lock_l2_activation_pct: 3.0,
            profit_lock_l2_floor_pct: 1.0,
            profit_lock_l1_activation_pct: 1.5,
            profit_lock_l1_floor_pct: 0.5,
            fixed_stop_loss_pct: -7.0,
            trailing_activation_pct: 5.0,
            trailing_min_profit_pct: 3.0,
            profit_target_pct: 10.0,
            rsi_overbought_threshold: 75.0,
            rsi_overbought_min_profit_pct: 3.0,
            profit_floor_activation_pct: 15.0,
            profit_floor_level_pct: 10.0,
            market_open: "09:00",
            market_close: "15:30",
            confirm_max_retries: 3,
            confirm_poll_interval_secs: 2,
            macro_stop_mult_by_regime,
            trailing_drop_by_regime,
            scale_out_levels_by_regime,
            regime_max_days,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub momentum_limit_timeout_secs: u64,
    pub momentum_limit_premium_pct: f64,
    pub enable_limit_orders: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            momentum_limit_timeout_secs: 10,
            momentum_limit_premium_pct: 0.3,
            enable_limit_orders: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub broker_http_timeout_secs: u64,
    pub rate_limit_market_data_per_sec: u32,
    pub rate_limit_trading_per_sec: u32,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_secs: u64,
    pub bar_refresh_secs: u64,
    pub position_refresh_secs: u64,
    pub reconcile_interval_secs: u64,
    pub dry_run: bool,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            broker_http_timeout_secs: 30,
            rate_limit_market_data_per_sec: 19,
            rate_limit_trading_per_sec: 5,
            circuit_breaker_failure_threshold: 20,
            circuit_breaker_reset_secs: 60,
            bar_refresh_secs: 60,
            position_refresh_secs: 300,
            reconcile_interval_secs: 60,
            dry_run: true,
        }
    }
}

/// Top-level configuration tree, assembled once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kis: KisConfig,
    pub risk: RiskConfig,
    pub scanner: ScannerConfig,
    pub sell: SellConfig,
    pub signal: SignalConfig,
    pub infra: InfraConfig,
}

impl Config {
    /// Build the configuration tree from the process environment.
    ///
    /// Values follow a prefix scheme: `DB_`, `REDIS_`,
    /// `KIS_`, `RISK_`, `SCANNER_`, `SELL_`, `SIGNAL_`, `INFRA_`. Anything
    /// missing falls back to the per-field default above, so a minimal dev
    /// environment (DB_URL + REDIS_URL only) still produces a workable
    /// config.
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env_var("DB_URL").context("DB_URL must be set")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
        };

        let redis = RedisConfig {
            url: env_or_string("REDIS_URL", "redis://127.0.0.1:6379"),
            ticks_stream: env_or_string("REDIS_TICKS_STREAM", "kis:prices"),
            buy_signals_stream: env_or_string("REDIS_BUY_SIGNALS_STREAM", "stream:buy-signals"),
            sell_orders_stream: env_or_string("REDIS_SELL_ORDERS_STREAM", "stream:sell-orders"),
            trade_notifications_stream: env_or_string(
                "REDIS_TRADE_NOTIFICATIONS_STREAM",
                "stream:trade-notifications",
            ),
        };

        let kis = KisConfig {
            app_key: env_or_string("KIS_APP_KEY", ""),
            app_secret: env_or_string("KIS_APP_SECRET", ""),
            base_url: env_or_string("KIS_BASE_URL", "https://openapi.koreainvestment.com:9443"),
            account_no: env_or_string("KIS_ACCOUNT_NO", ""),
            token_path: env_or_string("KIS_TOKEN_PATH", "/tmp/kis_token.json"),
        };

        let mut risk = RiskConfig::default();
        if let Some(v) = env_var("RISK_HARD_FLOOR").and_then(|v| v.parse().ok()) {
            risk.hard_floor = v;
        }
        if let Some(v) = env_var("RISK_MAX_BUY_COUNT_PER_DAY").and_then(|v| v.parse().ok()) {
            risk.max_buy_count_per_day = v;
        }
        if let Some(v) = env_var("RISK_CORRELATION_BLOCK_THRESHOLD").and_then(|v| v.parse().ok()) {
            risk.correlation_block_threshold = v;
        }

        let scanner = ScannerConfig::default();
        let sell = SellConfig::default();
        let signal = SignalConfig::default();

        let mut infra = InfraConfig::default();
        if let Some(v) = env_var("INFRA_DRY_RUN").and_then(|v| v.parse().ok()) {
            infra.dry_run = v;
        }

        let config = Self {
            database,
            redis,
            kis,
            risk,
            scanner,
            sell,
            signal,
            infra,
        };

        info!(
            redis_url = %config.redis.url,
            kis_base_url = %config.kis.base_url,
            dry_run = config.infra.dry_run,
            "configuration loaded from environment"
        );

        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_config_defaults() {
        let r = RiskConfig::default();
        assert_eq!(r.hard_floor, 40.0);
        assert_eq!(r.max_position_pct_default, 12.0);
        assert_eq!(r.max_position_pct_a_plus, 18.0);
        assert_eq!(r.portfolio_heat_limit_pct, 5.0);
        assert_eq!(r.cash_floor_by_regime.get("BULL"), Some(&10.0));
        assert_eq!(r.cash_floor_by_regime.get("STRONG_BEAR"), Some(&25.0));
    }

    #[test]
    fn sell_config_defaults_are_sane() {
        let s = SellConfig::default();
        assert_eq!(s.hard_stop_pct, -10.0);
        assert_eq!(s.confirm_max_retries, 3);
        assert_eq!(s.confirm_poll_interval_secs, 2);
    }

    #[test]
    fn scanner_config_defaults() {
        let s = ScannerConfig::default();
        assert_eq!(s.min_bars, 20);
        assert_eq!(s.signal_cooldown_secs, 600);
        assert_eq!(s.momentum_confirmation_bars, 1);
    }

    #[test]
    fn env_or_parses_and_falls_back() {
        assert_eq!(env_or::<u32>("KRX_CP_TEST_MISSING_VAR", 42), 42);
    }
}
