// =============================================================================
// KIS Broker Client — the sole owner of broker credentials and HTTP client
// =============================================================================
//
// Every operation passes through a rate limiter and a circuit breaker;
// trading ops never retry automatically. Signed-HTTP-client shape (builder
// pattern,
// `#[instrument]`, structured `debug!`/`warn!` logging, a redacted `Debug`
// impl) but rewritten for KIS's bearer-token auth scheme rather than
// per-request HMAC query signing.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::broker::rate_limit::{CircuitBreaker, TokenBucket};
use crate::config::KisConfig;
use crate::error::{BrokerError, GatewayError};
use crate::types::DailyCandle;

const BROKER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh the token this many seconds before it actually expires.
const TOKEN_REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedToken {
    access_token: String,
    expires_at_epoch: i64,
}

/// Market snapshot — KIS op `snapshot(code)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub code: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub change_pct: f64,
    pub per: f64,
    pub pbr: f64,
    pub high52w: f64,
    pub low52w: f64,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_no: Option<String>,
    pub price: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub filled: bool,
    pub filled_qty: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub cash: f64,
    pub total: f64,
    pub stock_eval: f64,
    pub positions: Vec<BrokerPosition>,
}

/// The broker's view of a held position, as returned by `balance()` — the
/// authority reconciliation compares against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub code: String,
    pub name: String,
    pub quantity: f64,
    pub avg_buy_price: f64,
}

/// KIS broker HTTP client. Cheap to clone — internally `Arc`-backed.
#[derive(Clone)]
pub struct KisClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    cfg: KisConfig,
    market_data_limiter: TokenBucket,
    trading_limiter: TokenBucket,
    circuit: CircuitBreaker,
    token: AsyncMutex<Option<PersistedToken>>,
}

impl KisClient {
    pub fn new(cfg: KisConfig, circuit_failure_threshold: u32, circuit_reset_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(BROKER_HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            inner: Arc::new(Inner {
                http,
                cfg,
                market_data_limiter: TokenBucket::new(19),
                trading_limiter: TokenBucket::new(5),
                circuit: CircuitBreaker::new(circuit_failure_threshold, circuit_reset_secs),
                token: AsyncMutex::new(None),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Token management — persisted bearer token, refreshed >=60s before expiry,
    // concurrent refreshes coalesced under a single async mutex.
    // -------------------------------------------------------------------------

    /// Return a valid bearer token, refreshing it first if missing or stale.
    /// Holding the mutex across the (rare) refresh call is what coalesces
    /// concurrent callers into a single refresh rather than one per caller.
    async fn ensure_token(&self) -> Result<String> {
        let mut guard = self.inner.token.lock().await;

        if let Some(t) = guard.as_ref() {
            if !token_stale(t) {
                return Ok(t.access_token.clone());
            }
        } else if let Ok(loaded) = load_persisted_token(&self.inner.cfg.token_path) {
            if !token_stale(&loaded) {
                *guard = Some(loaded.clone());
                return Ok(loaded.access_token);
            }
        }

        debug!("refreshing KIS bearer token");
        let refreshed = self.refresh_token_inner().await?;
        let _ = persist_token(&self.inner.cfg.token_path, &refreshed);
        let token = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok(token)
    }

    async fn refresh_token_inner(&self) -> Result<PersistedToken> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let url = format!("{}/oauth2/tokenP", self.inner.cfg.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.inner.cfg.app_key,
            "appsecret": self.inner.cfg.app_secret,
        });

        let resp = self
            .inner
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("token refresh request failed")?;

        let parsed: TokenResponse = resp.json().await.context("failed to parse token response")?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        info!("KIS bearer token refreshed");
        Ok(PersistedToken {
            access_token: parsed.access_token,
            expires_at_epoch: now + parsed.expires_in,
        })
    }

    fn auth_headers(&self, token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
            h.insert(reqwest::header::AUTHORIZATION, v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.inner.cfg.app_key) {
            h.insert("appkey", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.inner.cfg.app_secret) {
            h.insert("appsecret", v);
        }
        h
    }

    // -------------------------------------------------------------------------
    // Rate limit + circuit breaker gate, shared by every op below.
    // -------------------------------------------------------------------------

    fn check_market_data_gate(&self) -> Result<(), GatewayError> {
        if self.inner.circuit.is_open() {
            return Err(GatewayError::CircuitOpen {
                retry_after_secs: self.inner.circuit.retry_after_secs(),
            });
        }
        if !self.inner.market_data_limiter.try_acquire() {
            return Err(GatewayError::RateLimited);
        }
        Ok(())
    }

    fn check_trading_gate(&self) -> Result<(), GatewayError> {
        if self.inner.circuit.is_open() {
            return Err(GatewayError::CircuitOpen {
                retry_after_secs: self.inner.circuit.retry_after_secs(),
            });
        }
        if !self.inner.trading_limiter.try_acquire() {
            return Err(GatewayError::RateLimited);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "kis::snapshot")]
    pub async fn snapshot(&self, code: &str) -> Result<MarketSnapshot, GatewayError> {
        self.check_market_data_gate()?;
        let token = self.ensure_token().await?;
        let url = format!("{}/api/market/snapshot", self.inner.cfg.base_url);

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                let snap: MarketSnapshot = r.json().await.map_err(|e| GatewayError::Other(e.into()))?;
                Ok(snap)
            }
            Ok(r) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Broker(BrokerError::new(
                    r.status().as_str(),
                    "SNAPSHOT_FAIL",
                    format!("snapshot request failed for {code}"),
                )))
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    /// `daily_prices(code, days)`, 1<=days<=500.
    #[instrument(skip(self), name = "kis::daily_prices")]
    pub async fn daily_prices(&self, code: &str, days: u32) -> Result<Vec<DailyCandle>, GatewayError> {
        let days = days.clamp(1, 500);
        self.check_market_data_gate()?;
        let token = self.ensure_token().await?;
        let url = format!("{}/api/market/daily-prices", self.inner.cfg.base_url);

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&serde_json::json!({ "code": code, "days": days }))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                let candles: Vec<DailyCandle> =
                    r.json().await.map_err(|e| GatewayError::Other(e.into()))?;
                Ok(candles)
            }
            Ok(r) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Broker(BrokerError::new(
                    r.status().as_str(),
                    "DAILY_PRICES_FAIL",
                    format!("daily-prices request failed for {code}"),
                )))
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trading
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "kis::place_order")]
    pub async fn place_order(
        &self,
        code: &str,
        side: Side,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<OrderResult, GatewayError> {
        self.check_trading_gate()?;
        let token = self.ensure_token().await?;
        let side_str = if side == Side::Buy { "buy" } else { "sell" };
        let url = format!("{}/api/trading/{}", self.inner.cfg.base_url, side_str);

        let body = serde_json::json!({
            "code": code,
            "qty": qty,
            "order_type": if order_type == OrderType::Market { "market" } else { "limit" },
            "price": price,
        });

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                let result: OrderResult = r.json().await.map_err(|e| GatewayError::Other(e.into()))?;
                Ok(result)
            }
            Ok(r) => {
                // A rejected order is a legitimate broker response, not a
                // transport failure — but it still counts against the
                // consecutive-failure window.
                self.inner.circuit.record_failure();
                let status = r.status();
                let message = r.text().await.unwrap_or_default();
                warn!(code, ?side, status = %status, message, "order placement rejected");
                Ok(OrderResult {
                    success: false,
                    order_no: None,
                    price: None,
                    message,
                })
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    #[instrument(skip(self), name = "kis::cancel")]
    pub async fn cancel(&self, order_no: &str) -> Result<bool, GatewayError> {
        self.check_trading_gate()?;
        let token = self.ensure_token().await?;
        let url = format!("{}/api/trading/cancel", self.inner.cfg.base_url);

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&serde_json::json!({ "order_no": order_no }))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                #[derive(Deserialize)]
                struct CancelResp {
                    success: bool,
                }
                let parsed: CancelResp = r.json().await.unwrap_or(CancelResp { success: false });
                Ok(parsed.success)
            }
            Ok(_) => {
                self.inner.circuit.record_failure();
                Ok(false)
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    /// `order_status(order_no)` never throws; it returns null on
    /// failure". We model that contract as `Option<OrderStatus>` with no
    /// `Err` path at all.
    #[instrument(skip(self), name = "kis::order_status")]
    pub async fn order_status(&self, order_no: &str) -> Option<OrderStatus> {
        if self.inner.circuit.is_open() {
            return None;
        }
        if !self.inner.trading_limiter.try_acquire() {
            return None;
        }
        let token = self.ensure_token().await.ok()?;
        let url = format!("{}/api/trading/order-status", self.inner.cfg.base_url);

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&serde_json::json!({ "order_no": order_no }))
            .send()
            .await
            .ok()?;

        if !resp.status().is_success() {
            self.inner.circuit.record_failure();
            return None;
        }
        self.inner.circuit.record_success();
        resp.json::<OrderStatus>().await.ok()
    }

    #[instrument(skip(self), name = "kis::balance")]
    pub async fn balance(&self) -> Result<AccountBalance, GatewayError> {
        self.check_market_data_gate()?;
        let token = self.ensure_token().await?;
        let url = format!("{}/api/account/balance", self.inner.cfg.base_url);

        let resp = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                let bal: AccountBalance = r.json().await.map_err(|e| GatewayError::Other(e.into()))?;
                Ok(bal)
            }
            Ok(r) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Broker(BrokerError::new(
                    r.status().as_str(),
                    "BALANCE_FAIL",
                    "balance request failed",
                )))
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(GatewayError::Transport(e))
            }
        }
    }

    /// Integer cash strictly available for new orders.
    pub async fn buying_power(&self) -> Result<i64, GatewayError> {
        let bal = self.balance().await?;
        Ok(bal.cash.floor() as i64)
    }

    /// Degrades to a plain weekday check if the broker call fails.
    pub async fn is_trading_day(&self, date: Option<NaiveDate>) -> bool {
        let date = date.unwrap_or_else(|| chrono::Utc::now().date_naive());
        if self.inner.circuit.is_open() || !self.inner.market_data_limiter.try_acquire() {
            return is_weekday(date);
        }
        let token = match self.ensure_token().await {
            Ok(t) => t,
            Err(_) => return is_weekday(date),
        };
        let url = format!("{}/api/market/is-trading-day", self.inner.cfg.base_url);
        let resp = self
            .inner
            .http
            .get(&url)
            .headers(self.auth_headers(&token))
            .query(&[("date", date.format("%Y-%m-%d").to_string())])
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                #[derive(Deserialize)]
                struct Resp {
                    is_trading_day: bool,
                }
                r.json::<Resp>().await.map(|b| b.is_trading_day).unwrap_or_else(|_| is_weekday(date))
            }
            _ => {
                self.inner.circuit.record_failure();
                is_weekday(date)
            }
        }
    }

    pub async fn is_market_open(&self) -> bool {
        if self.inner.circuit.is_open() || !self.inner.market_data_limiter.try_acquire() {
            return fallback_market_hours();
        }
        let token = match self.ensure_token().await {
            Ok(t) => t,
            Err(_) => return fallback_market_hours(),
        };
        let url = format!("{}/api/market/is-market-open", self.inner.cfg.base_url);
        let resp = self
            .inner
            .http
            .get(&url)
            .headers(self.auth_headers(&token))
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                self.inner.circuit.record_success();
                #[derive(Deserialize)]
                struct Resp {
                    is_open: bool,
                }
                r.json::<Resp>().await.map(|b| b.is_open).unwrap_or(true)
            }
            _ => {
                self.inner.circuit.record_failure();
                fallback_market_hours()
            }
        }
    }

    /// `POST /api/realtime/subscribe` — tell the gateway's WS ingester to
    /// start streaming ticks for a newly-monitored code.
    pub async fn subscribe_realtime(&self, code: &str) -> Result<(), GatewayError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/api/realtime/subscribe", self.inner.cfg.base_url);
        let _ = self
            .inner
            .http
            .post(&url)
            .headers(self.auth_headers(&token))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await;
        Ok(())
    }
}

/// Degraded-mode market-hours check used only when the broker call itself
/// can't be made (circuit open / rate limited / token refresh failed) — a
/// plain KRX regular-session window, weekends excluded.
fn fallback_market_hours() -> bool {
    use chrono::Timelike;
    let now_kst = chrono::Utc::now().with_timezone(&chrono_tz::Asia::Seoul);
    if !is_weekday(now_kst.date_naive()) {
        return false;
    }
    let minutes = now_kst.hour() * 60 + now_kst.minute();
    (9 * 60..=15 * 60 + 30).contains(&minutes)
}

fn is_weekday(date: NaiveDate) -> bool {
    use chrono::Datelike;
    !matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

fn token_stale(t: &PersistedToken) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    now + TOKEN_REFRESH_SKEW_SECS >= t.expires_at_epoch
}

fn load_persisted_token(path: &str) -> Result<PersistedToken> {
    let content = std::fs::read_to_string(path).context("token file not readable")?;
    serde_json::from_str(&content).context("token file malformed")
}

fn persist_token(path: &str, token: &PersistedToken) -> Result<()> {
    let content = serde_json::to_string(token)?;
    std::fs::write(path, content).context("failed to persist token file")
}

impl std::fmt::Debug for KisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisClient")
            .field("base_url", &self.inner.cfg.base_url)
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_stale_detects_near_expiry() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let fresh = PersistedToken {
            access_token: "x".into(),
            expires_at_epoch: now + 3600,
        };
        assert!(!token_stale(&fresh));

        let stale = PersistedToken {
            access_token: "x".into(),
            expires_at_epoch: now + 30,
        };
        assert!(token_stale(&stale));
    }

    #[test]
    fn is_weekday_excludes_weekend() {
        // 2026-07-25 is a Saturday.
        let sat = NaiveDate::from_ymd_opt(2026, 7, 25).unwrap();
        assert!(!is_weekday(sat));
        let mon = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        assert!(is_weekday(mon));
    }
}
