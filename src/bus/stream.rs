// =============================================================================
// StreamBus — capped Redis Streams with consumer-group, pre-ack semantics
// =============================================================================
//
// Four append-only streams (`kis:prices`, `stream:buy-signals`,
// `stream:sell-orders`, `stream:trade-notifications`), each joined by a
// named consumer group. Delivery is **at-most-once**: the
// caller acks the message *before* the handler runs, so a handler panic or
// process crash never causes duplicate order emission — a dropped signal is
// strictly preferable to a doubled one (a fresh signal arrives on the next
// bar anyway).
// =============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

/// How long a pending entry may sit unacknowledged before a fresh consumer
/// reclaims it on startup.
const PENDING_RECLAIM_IDLE_MS: u64 = 60_000;

/// Approximate cap applied to every stream via `MAXLEN ~`.
const DEFAULT_STREAM_MAXLEN: usize = 10_000;

/// A typed handle onto one Redis stream, used by producers.
#[derive(Clone)]
pub struct StreamBus {
    conn: ConnectionManager,
    stream_key: String,
    maxlen: usize,
}

impl StreamBus {
    pub fn new(conn: ConnectionManager, stream_key: impl Into<String>) -> Self {
        Self {
            conn,
            stream_key: stream_key.into(),
            maxlen: DEFAULT_STREAM_MAXLEN,
        }
    }

    pub fn with_maxlen(mut self, maxlen: usize) -> Self {
        self.maxlen = maxlen;
        self
    }

    /// Publish a serializable payload onto the stream under field `payload`,
    /// approximately trimmed to `maxlen` entries (`XADD key MAXLEN ~ n * field
    /// value`).
    pub async fn publish<T: Serialize>(&self, value: &T) -> Result<String> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value).context("failed to serialize stream message")?;

        let id: String = conn
            .xadd_maxlen(
                &self.stream_key,
                redis::streams::StreamMaxlen::Approx(self.maxlen),
                "*",
                &[("payload", payload)],
            )
            .await
            .with_context(|| format!("XADD failed on stream {}", self.stream_key))?;

        debug!(stream = %self.stream_key, id = %id, "published message");
        Ok(id)
    }
}

/// A named cursor on a stream — one consumer group, one stable consumer name
/// per process, so consumer-group cursors are never shared across workers.
pub struct ConsumerGroup {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

/// One message pulled off the stream, already carrying its raw entry id so
/// the caller can ack it.
pub struct RawMessage {
    pub id: String,
    pub payload: String,
}

impl ConsumerGroup {
    /// Join (creating if necessary) `group` on `stream_key`, identifying this
    /// process as `consumer`.
    pub async fn join(
        mut conn: ConnectionManager,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self> {
        let stream_key = stream_key.into();
        let group = group.into();

        // MKSTREAM: create the stream too if it doesn't exist yet.
        let created: Result<(), _> = conn
            .xgroup_create_mkstream(&stream_key, &group, "0")
            .await;
        match created {
            Ok(()) => info!(stream = %stream_key, group = %group, "consumer group created"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream_key, group = %group, "consumer group already exists");
            }
            Err(e) => return Err(e).context("XGROUP CREATE failed"),
        }

        Ok(Self {
            conn,
            stream_key,
            group,
            consumer: consumer.into(),
        })
    }

    /// Reclaim pending entries idle longer than [`PENDING_RECLAIM_IDLE_MS`]
    /// via an XCLAIM-equivalent, returning them so the caller can run them
    /// through the same handler path it uses for fresh messages. Called once
    /// at startup.
    pub async fn reclaim_pending(&mut self) -> Result<Vec<RawMessage>> {
        let pending: redis::streams::StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", 100)
            .await
            .context("XPENDING failed")?;

        let mut ids = Vec::new();
        for item in pending.ids {
            if item.time_since_delivered >= PENDING_RECLAIM_IDLE_MS {
                ids.push(item.id);
            }
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        info!(stream = %self.stream_key, group = %self.group, count = ids.len(), "reclaiming idle pending entries");

        let claimed: StreamReadReply = self
            .conn
            .xclaim(
                &self.stream_key,
                &self.group,
                &self.consumer,
                PENDING_RECLAIM_IDLE_MS,
                &ids,
            )
            .await
            .context("XCLAIM failed")?;

        Ok(extract_messages(claimed))
    }

    /// Block for new entries (2-5s, to reduce busy-poll).
    pub async fn read(&mut self, block_ms: usize, count: usize) -> Result<Vec<RawMessage>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block_ms);

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.stream_key.clone()], &[">"], &opts)
            .await
            .context("XREADGROUP failed")?;

        Ok(extract_messages(reply))
    }

    /// Acknowledge a message. Callers MUST ack *before* invoking the business
    /// handler — see module docs.
    pub async fn ack(&mut self, id: &str) -> Result<()> {
        let _: i64 = self
            .conn
            .xack(&self.stream_key, &self.group, &[id])
            .await
            .context("XACK failed")?;
        Ok(())
    }

    /// Deserialize a raw message payload, logging and returning `None` on
    /// schema mismatch (the message is already acked by this point — a
    /// malformed message is dropped, never retried).
    pub fn decode<T: DeserializeOwned>(&self, msg: &RawMessage) -> Option<T> {
        match serde_json::from_str(&msg.payload) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(stream = %self.stream_key, id = %msg.id, error = %e, "dropping undeserializable message");
                None
            }
        }
    }
}

fn extract_messages(reply: StreamReadReply) -> Vec<RawMessage> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id_entry in key.ids {
            let payload = id_entry
                .map
                .get("payload")
                .and_then(|v| match v {
                    redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
                    redis::Value::Status(s) => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            out.push(RawMessage {
                id: id_entry.id,
                payload,
            });
        }
    }
    out
}
