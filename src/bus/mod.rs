// =============================================================================
// Message Bus & Typed Cache — Redis Streams substrate
// =============================================================================
//
// A log-structured message bus with consumer-group semantics (at-most-once,
// pre-ack) plus a typed key/value cache, built directly on Redis Streams
// (`XADD`/`XREADGROUP`) and `SET ... NX EX` locks.
// =============================================================================

pub mod cache;
pub mod stream;

pub use cache::{HashCache, ScalarCache};
pub use stream::{ConsumerGroup, StreamBus};
