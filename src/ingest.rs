//! Ingestion Loop - the single reader of the primary stream.
//!
//! Pulls one message at a time, decodes it and hands it to its lane. The
//! next message is only pulled once the current one is enqueued or dropped,
//! so a full lane holds back the whole stream.
//!
//! Undecodable messages are logged and dropped: they never became an event,
//! so there is nothing to retry or dead-letter.
//!
//! On cancellation (or when the stream closes) the loop closes every lane
//! queue. Lanes keep draining what was already buffered.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::InventoryEvent;
use crate::pool::{DispatchError, LaneDispatcher};
use crate::stream::{StreamError, StreamReader};

/// Pause after a failed stream read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Counters reported when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub received: u64,
    pub dispatched: u64,
    pub undecodable: u64,
    pub read_errors: u64,
}

pub struct IngestionLoop {
    reader: Box<dyn StreamReader>,
    dispatcher: LaneDispatcher,
}

impl IngestionLoop {
    pub fn new(reader: Box<dyn StreamReader>, dispatcher: LaneDispatcher) -> Self {
        Self { reader, dispatcher }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<IngestReport> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until cancelled or the stream closes, then close the lanes.
    pub async fn run(mut self, cancel: CancellationToken) -> IngestReport {
        let mut report = IngestReport::default();
        info!(lanes = self.dispatcher.lane_count(), "Ingestion started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation received, no longer pulling events");
                    break;
                }
                next = self.reader.next_message() => next,
            };

            let message = match next {
                Ok(message) => message,
                Err(StreamError::Closed) => {
                    info!("Primary stream closed");
                    break;
                }
                Err(e) => {
                    report.read_errors += 1;
                    warn!(error = %e, "Failed to read primary stream");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };
            report.received += 1;

            let event = match InventoryEvent::decode(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    report.undecodable += 1;
                    warn!(stream_id = %message.id, error = %e, "Dropping undecodable message");
                    continue;
                }
            };

            let item_id = event.item_id.clone();
            match self.dispatcher.dispatch(event, &cancel).await {
                Ok(lane) => {
                    report.dispatched += 1;
                    debug!(stream_id = %message.id, item_id = %item_id, lane = lane, "Event dispatched");
                }
                Err(DispatchError::Cancelled { lane }) => {
                    warn!(
                        stream_id = %message.id,
                        item_id = %item_id,
                        lane = lane,
                        "Cancelled while lane was full, event not enqueued"
                    );
                    break;
                }
                Err(e @ DispatchError::LaneClosed { .. }) => {
                    error!(stream_id = %message.id, item_id = %item_id, error = %e, "Lane unavailable");
                    break;
                }
            }
        }

        self.dispatcher.close();
        info!(
            received = report.received,
            dispatched = report.dispatched,
            undecodable = report.undecodable,
            "Ingestion stopped"
        );
        report
    }
}
