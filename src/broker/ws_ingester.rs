// =============================================================================
// KIS WebSocket Tick Ingester
// =============================================================================
//
// Subscribes to real-time ticks for the active
// watchlist over the KIS real-time WebSocket and republishes every tick onto
// `kis:prices` (approx-capped at 10 000 entries). Built on the same
// `market_data/trade_stream.rs` connect/read/reconnect loop shape, rewritten
// for KIS's pipe-delimited envelope instead of Binance's JSON aggTrade frames.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::bus::StreamBus;
use crate::config::KisConfig;
use crate::types::Tick;

/// Approval keys are valid for a while; we refresh well before they could be
/// stale so a reconnect never races an expired key.
const APPROVAL_KEY_TTL: Duration = Duration::from_secs(30);
/// Pacing between individual subscribe frames so a large watchlist doesn't
/// burst the socket.
const SUBSCRIBE_PACING: Duration = Duration::from_millis(50);
/// Wait before attempting a reconnect after the socket drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Runtime handle used by other tasks (e.g. the watchlist refresher) to add
/// newly-promoted codes to the live subscription set without restarting the
/// ingester.
#[derive(Clone)]
pub struct SubscriptionHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl SubscriptionHandle {
    pub fn subscribe(&self, code: impl Into<String>) {
        let _ = self.tx.send(code.into());
    }
}

struct ApprovalKey {
    key: String,
    fetched_at: std::time::Instant,
}

/// Fetch (or reuse, if still fresh) the WebSocket approval key used to open
/// the realtime socket.
async fn fetch_approval_key(cfg: &KisConfig, cached: &RwLock<Option<ApprovalKey>>) -> Result<String> {
    if let Some(existing) = cached.read().as_ref() {
        if existing.fetched_at.elapsed() < APPROVAL_KEY_TTL {
            return Ok(existing.key.clone());
        }
    }

    #[derive(serde::Deserialize)]
    struct ApprovalResp {
        approval_key: String,
    }

    let http = reqwest::Client::new();
    let url = format!("{}/oauth2/Approval", cfg.base_url);
    let resp = http
        .post(&url)
        .json(&serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": cfg.app_key,
            "secretkey": cfg.app_secret,
        }))
        .send()
        .await
        .context("approval key request failed")?;

    let parsed: ApprovalResp = resp.json().await.context("failed to parse approval key response")?;
    *cached.write() = Some(ApprovalKey {
        key: parsed.approval_key.clone(),
        fetched_at: std::time::Instant::now(),
    });
    Ok(parsed.approval_key)
}

/// Run the ingester forever, reconnecting on drop. `initial_codes` seeds the
/// subscription set; further codes can be added live via the returned
/// [`SubscriptionHandle`].
pub async fn run(
    cfg: KisConfig,
    ws_url: String,
    bus: StreamBus,
    initial_codes: Vec<String>,
) -> (SubscriptionHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    for code in &initial_codes {
        let _ = tx.send(code.clone());
    }

    let handle = tokio::spawn(run_loop(cfg, ws_url, bus, rx));
    (SubscriptionHandle { tx }, handle)
}

async fn run_loop(
    cfg: KisConfig,
    ws_url: String,
    bus: StreamBus,
    mut new_codes: mpsc::UnboundedReceiver<String>,
) {
    let cached_key: RwLock<Option<ApprovalKey>> = RwLock::new(None);
    let mut subscribed: Vec<String> = Vec::new();

    // Drain any codes queued before the first connection attempt.
    while let Ok(code) = new_codes.try_recv() {
        if !subscribed.contains(&code) {
            subscribed.push(code);
        }
    }

    loop {
        match connect_and_stream(&cfg, &ws_url, &bus, &cached_key, &subscribed, &mut new_codes).await {
            Ok(()) => info!("KIS realtime stream ended cleanly, reconnecting"),
            Err(e) => error!(error = %e, "KIS realtime stream failed, reconnecting"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_stream(
    cfg: &KisConfig,
    ws_url: &str,
    bus: &StreamBus,
    cached_key: &RwLock<Option<ApprovalKey>>,
    subscribed: &[String],
    new_codes: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let approval_key = fetch_approval_key(cfg, cached_key).await?;

    let (ws_stream, _resp) = connect_async(ws_url)
        .await
        .context("failed to connect to KIS realtime WebSocket")?;
    info!(url = %ws_url, "KIS realtime WebSocket connected");

    let (mut write, mut read) = ws_stream.split();

    let mut live: Vec<String> = subscribed.to_vec();
    for code in &live {
        send_subscribe_frame(&mut write, &approval_key, code).await?;
        sleep(SUBSCRIBE_PACING).await;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(tick) = parse_tick_frame(&text) {
                            if let Err(e) = bus.publish(&tick).await {
                                warn!(error = %e, "failed to publish tick onto bus");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("realtime WebSocket read error"),
                    None => {
                        warn!("KIS realtime WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
            code = new_codes.recv() => {
                match code {
                    Some(code) if !live.contains(&code) => {
                        send_subscribe_frame(&mut write, &approval_key, &code).await?;
                        live.push(code);
                        sleep(SUBSCRIBE_PACING).await;
                    }
                    Some(_) => {}
                    None => {}
                }
            }
        }
    }
}

async fn send_subscribe_frame(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    approval_key: &str,
    code: &str,
) -> Result<()> {
    let frame = serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": "1",
            "content-type": "utf-8",
        },
        "body": {
            "input": {
                "tr_id": "H0STCNT0",
                "tr_key": code,
            }
        }
    });
    write
        .send(Message::Text(frame.to_string()))
        .await
        .context("failed to send subscribe frame")?;
    debug!(code, "sent realtime subscribe frame");
    Ok(())
}

/// Parse a KIS realtime tick frame.
///
/// Envelope: `encrypt_flag|tr_id|record_count|records` pipe-delimited, where
/// `records` is itself `^`-delimited. For `H0STCNT0` (contract/execution)
/// records the fields of interest are: 0 = code, 2 = current price,
/// 5 = day high, 10 = cumulative volume.
fn parse_tick_frame(text: &str) -> Option<Tick> {
    let mut parts = text.splitn(4, '|');
    let _encrypt_flag = parts.next()?;
    let tr_id = parts.next()?;
    if tr_id != "H0STCNT0" {
        return None;
    }
    let _count = parts.next()?;
    let body = parts.next()?;

    let fields: Vec<&str> = body.split('^').collect();
    let code = fields.first()?.to_string();
    let price: f64 = fields.get(2)?.parse().ok()?;
    let high: f64 = fields.get(5).and_then(|v| v.parse().ok()).unwrap_or(price);
    let volume: f64 = fields.get(10).and_then(|v| v.parse().ok()).unwrap_or(0.0);

    Some(Tick {
        code,
        price,
        high_of_day: high,
        volume_delta: volume,
        server_timestamp: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_contract_frame() {
        let frame = "0|H0STCNT0|001|005930^093000^71500^1^71600^71000^70000^70100^71500^71400^1234567^0^0^0^0^0^0^0^0^0";
        let tick = parse_tick_frame(frame).expect("should parse");
        assert_eq!(tick.code, "005930");
        assert_eq!(tick.price, 71500.0);
    }

    #[test]
    fn ignores_non_contract_tr_id() {
        let frame = "0|H0STASP0|001|005930^093000^71500";
        assert!(parse_tick_frame(frame).is_none());
    }

    #[test]
    fn handles_malformed_frame_gracefully() {
        assert!(parse_tick_frame("garbage").is_none());
    }
}
