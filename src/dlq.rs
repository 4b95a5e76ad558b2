//! Dead-letter pipeline for events that exhausted their retries.
//!
//! The producer side ([`DeadLetterQueue`]) republishes the failed event unchanged,
//! keyed by its item id, to the dead-letter stream. The consumer side
//! ([`DeadLetterConsumer`]) reads that stream with a single unsharded loop
//! and replays each event through the same [`EventProcessor`] once.
//!
//! A replay that fails again is logged and dropped. There is no second-level
//! dead-letter stream and no persistent error store.
//!
//! # Example
//!
//! ```rust,ignore
//! use inventory_sync::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(Arc::new(RedisStreamWriter::new(pool, DLQ_STREAM_NAME)));
//! dlq.publish(&event).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::InventoryEvent;
use crate::processor::EventProcessor;
use crate::stream::{StreamError, StreamReader, StreamWriter};

/// Pause after a failed dead-letter read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that can occur when publishing to the dead-letter stream.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Dead-letter stream error: {0}")]
    StreamError(#[from] StreamError),
}

/// Producer side of the dead-letter stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    writer: Arc<dyn StreamWriter>,
}

impl DeadLetterQueue {
    pub fn new(writer: Arc<dyn StreamWriter>) -> Self {
        Self { writer }
    }

    /// Republish `event` verbatim, keyed by its item id.
    pub async fn publish(&self, event: &InventoryEvent) -> Result<String, DlqError> {
        let payload = event.encode()?;
        let id = self
            .writer
            .publish(&event.item_id, payload.as_bytes())
            .await?;

        info!(
            dlq_id = %id,
            item_id = %event.item_id,
            event_type = %event.kind,
            "Event moved to dead-letter stream"
        );

        Ok(id)
    }
}

/// Consumer side: replays dead-lettered events through the processor.
pub struct DeadLetterConsumer {
    reader: Box<dyn StreamReader>,
    processor: Arc<EventProcessor>,
}

/// Counters reported when the replay loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: u64,
    pub recovered: u64,
    pub failed: u64,
    pub undecodable: u64,
}

impl DeadLetterConsumer {
    pub fn new(reader: Box<dyn StreamReader>, processor: Arc<EventProcessor>) -> Self {
        Self { reader, processor }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<ReplayReport> {
        tokio::spawn(self.run(cancel))
    }

    /// Replay until cancelled or the stream closes.
    pub async fn run(mut self, cancel: CancellationToken) -> ReplayReport {
        let mut report = ReplayReport::default();
        info!("Dead-letter replay started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.reader.next_message() => next,
            };

            let message = match next {
                Ok(message) => message,
                Err(StreamError::Closed) => {
                    info!("Dead-letter stream closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read dead-letter stream");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let event = match InventoryEvent::decode(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    report.undecodable += 1;
                    warn!(stream_id = %message.id, error = %e, "Skipping undecodable dead-letter message");
                    continue;
                }
            };

            report.replayed += 1;
            debug!(stream_id = %message.id, item_id = %event.item_id, "Replaying dead-lettered event");

            match self.processor.replay(&event).await {
                Ok(applied) => {
                    report.recovered += 1;
                    info!(
                        item_id = %event.item_id,
                        event_type = %event.kind,
                        attempts = applied.attempts,
                        "Dead-lettered event replayed successfully"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        item_id = %event.item_id,
                        event_type = %event.kind,
                        error = %e,
                        "Dead-lettered event failed again, giving up"
                    );
                }
            }
        }

        info!(
            replayed = report.replayed,
            recovered = report.recovered,
            failed = report.failed,
            "Dead-letter replay stopped"
        );
        report
    }
}
