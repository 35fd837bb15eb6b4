// =============================================================================
// Broker Gateway — KIS REST client, rate limiting, and realtime ingestion
// =============================================================================
//
// `client.rs` is a signed-HTTP-client wrapping KIS's bearer-token auth;
// `rate_limit.rs` is an atomic token-bucket plus circuit breaker;
// `ws_ingester.rs` is a multi-symbol, dynamically-subscribed realtime feed
// over KIS's pipe/caret tick envelope.
// =============================================================================

pub mod client;
pub mod rate_limit;
pub mod ws_ingester;

pub use client::{AccountBalance, BrokerPosition, KisClient, MarketSnapshot, OrderResult, OrderStatus, OrderType, Side};
