//! Stream transport for the primary and dead-letter event streams.
//!
//! Events travel over Redis Streams. Each entry carries a `key` field (the
//! item id) and a `payload` field (the event JSON). Readers consume through
//! a consumer group so several consumer instances share one stream.
//!
//! An entry is acknowledged when the reader hands it out: delivery commits on
//! read, and an event buffered in a lane when the process dies is lost.
//! Entries read from Redis but not yet handed out stay pending, and a
//! reconnecting consumer reads its own pending entries before new ones.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Field holding the message key.
pub const KEY_FIELD: &str = "key";

/// Field holding the serialized event.
pub const PAYLOAD_FIELD: &str = "payload";

/// Maximum entries kept per stream (older entries are trimmed).
pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

/// Idle time after which another consumer's pending entries are claimed.
const PENDING_IDLE_THRESHOLD_MS: u64 = 30_000;

/// Pending entries claimed per connect.
const CLAIM_BATCH: usize = 100;

/// Errors from the stream transport.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    /// The stream has no more messages and never will.
    #[error("stream closed")]
    Closed,
}

/// A raw message pulled from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Transport-assigned id (e.g., "1234567890123-0")
    pub id: String,

    pub key: Option<String>,

    pub payload: Vec<u8>,
}

/// Pulls messages one at a time, in stream order.
#[async_trait]
pub trait StreamReader: Send {
    /// Wait for the next message.
    ///
    /// Must be cancel-safe: dropping the returned future loses no message
    /// that was already handed to this reader.
    async fn next_message(&mut self) -> Result<StreamMessage, StreamError>;
}

/// Appends keyed messages to a stream.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Publish `payload` under `key`, returning the assigned message id.
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, StreamError>;
}

/// Where the next group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadPosition {
    /// Replaying this consumer's pending entries after the given id.
    Backlog(String),
    /// Reading entries never delivered to the group (`>`).
    New,
}

impl ReadPosition {
    fn start() -> Self {
        ReadPosition::Backlog("0".to_string())
    }

    fn id(&self) -> &str {
        match self {
            ReadPosition::Backlog(after) => after,
            ReadPosition::New => ">",
        }
    }

    /// Move past the last entry of a read. An empty backlog read means the
    /// backlog is exhausted.
    fn advance(&mut self, last_id: Option<&str>) {
        if let ReadPosition::Backlog(after) = self {
            match last_id {
                Some(id) => *after = id.to_string(),
                None => *self = ReadPosition::New,
            }
        }
    }
}

/// Consumer-group reader over a Redis stream.
///
/// Reads one entry per round trip by default, so the stream is not pulled
/// again until the previous entry has been handed out.
pub struct RedisStreamReader {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    block_ms: usize,
    batch_size: usize,
    position: ReadPosition,
    buffer: VecDeque<StreamMessage>,
}

impl RedisStreamReader {
    /// Connect to `stream` as `consumer` within `group`, creating the group
    /// (and the stream) if needed.
    ///
    /// Entries left pending by consumers idle for longer than 30 s are
    /// claimed; they are delivered first, together with this consumer's own
    /// pending entries.
    pub async fn connect(
        pool: Pool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, StreamError> {
        let reader = Self {
            pool,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block_ms: 2000,
            batch_size: 1,
            position: ReadPosition::start(),
            buffer: VecDeque::new(),
        };
        reader.ensure_group().await?;

        match reader.claim_abandoned().await {
            Ok(0) => {}
            Ok(count) => info!(
                stream = %reader.stream,
                count = count,
                "Claimed pending messages from previous workers"
            ),
            // XAUTOCLAIM needs Redis 6.2
            Err(e) => debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery"),
        }

        Ok(reader)
    }

    /// Set how many entries one read may return. Entries read ahead stay
    /// pending until handed out.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StreamError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            StreamError::ConnectionError(e.to_string())
        })
    }

    async fn ensure_group(&self) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;

        let created: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream, consumer_group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, consumer_group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => {
                error!(stream = %self.stream, error = %e, "Failed to create consumer group");
                Err(StreamError::RedisError(e.to_string()))
            }
        }
    }

    /// Move entries idle in other consumers' pending lists to this one.
    async fn claim_abandoned(&self) -> Result<usize, StreamError> {
        let mut conn = self.connection().await?;

        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(PENDING_IDLE_THRESHOLD_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamError::RedisError(e.to_string()))?;

        Ok(claimed_count(&reply))
    }

    /// Read the next batch into the buffer. Nothing is acknowledged here.
    async fn fill(&mut self) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;

        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size);
        if self.position == ReadPosition::New {
            opts = opts.block(self.block_ms);
        }

        let reply: StreamReadReply = match conn
            .xread_options(&[self.stream.as_str()], &[self.position.id()], &opts)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err_str = e.to_string();
                // Blocking read timed out with nothing to deliver
                if err_str.contains("timed out") || err_str.contains("response was nil") {
                    return Ok(());
                }
                return Err(StreamError::RedisError(err_str));
            }
        };

        let mut last_id = None;
        for stream_key in reply.keys {
            for element in stream_key.ids {
                last_id = Some(element.id.clone());
                self.buffer.push_back(StreamMessage {
                    key: field_string(&element.map, KEY_FIELD),
                    payload: field_bytes(&element.map, PAYLOAD_FIELD).unwrap_or_default(),
                    id: element.id,
                });
            }
        }

        if let ReadPosition::Backlog(_) = self.position {
            if last_id.is_some() {
                info!(stream = %self.stream, count = self.buffer.len(), "Redelivering pending messages");
            }
        }
        self.position.advance(last_id.as_deref());
        Ok(())
    }

    async fn ack(&self, id: &str) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(&self.stream, &self.group, std::slice::from_ref(&id))
            .await
            .map_err(|e| StreamError::RedisError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StreamReader for RedisStreamReader {
    async fn next_message(&mut self) -> Result<StreamMessage, StreamError> {
        loop {
            if let Some(id) = self.buffer.front().map(|message| message.id.clone()) {
                // Acked while still buffered: a cancelled ack loses nothing
                if let Err(e) = self.ack(&id).await {
                    warn!(
                        stream = %self.stream,
                        stream_id = %id,
                        error = %e,
                        "Failed to ACK message, it stays pending until the next connect"
                    );
                }
                if let Some(message) = self.buffer.pop_front() {
                    return Ok(message);
                }
            }
            self.fill().await?;
        }
    }
}

/// Appends to a Redis stream with approximate trimming.
#[derive(Clone)]
pub struct RedisStreamWriter {
    pool: Pool,
    stream: String,
    max_len: usize,
}

impl RedisStreamWriter {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
            max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

#[async_trait]
impl StreamWriter for RedisStreamWriter {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, StreamError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StreamError::ConnectionError(e.to_string()))?;

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(KEY_FIELD)
            .arg(key)
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(stream = %self.stream, error = %e, "Failed to append to stream");
                StreamError::RedisError(e.to_string())
            })?;

        Ok(id)
    }
}

/// Number of ids in an `XAUTOCLAIM ... JUSTID` reply.
fn claimed_count(reply: &RedisValue) -> usize {
    match reply {
        RedisValue::Array(parts) => match parts.get(1) {
            Some(RedisValue::Array(ids)) => ids.len(),
            _ => 0,
        },
        _ => 0,
    }
}

/// Extract a field from Redis stream data as raw bytes.
fn field_bytes(map: &HashMap<String, RedisValue>, field: &str) -> Option<Vec<u8>> {
    match map.get(field)? {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

/// Extract a non-empty string field from Redis stream data.
fn field_string(map: &HashMap<String, RedisValue>, field: &str) -> Option<String> {
    field_bytes(map, field)
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .filter(|s| !s.is_empty())
}
