//! Worker Pool - one single-threaded lane per shard.
//!
//! Each lane owns a bounded FIFO queue and a task that applies the queued
//! events one at a time. A lane never starts the next event until the
//! processor has resolved the current one (applied, dropped or
//! dead-lettered), so events for one key are applied in arrival order.
//!
//! ```text
//!                      ┌─► [queue 0] ─► lane 0 ─┐
//! Ingestion ─► route ──┼─► [queue 1] ─► lane 1 ─┼─► EventProcessor
//!                      └─► [queue N] ─► lane N ─┘
//! ```
//!
//! Enqueueing into a full queue waits for space, which stalls ingestion and
//! therefore the stream pull (backpressure).

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::InventoryEvent;
use crate::processor::EventProcessor;
use crate::router::ShardRouter;

/// Default lane count.
pub const DEFAULT_LANES: usize = 5;

/// Default per-lane queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Lanes log a statistics line every this many events.
const STATS_INTERVAL: u64 = 100;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Cancellation fired while waiting for queue space; the event was not
    /// enqueued.
    #[error("dispatch cancelled while lane {lane} was full")]
    Cancelled { lane: usize },

    #[error("lane {lane} is closed")]
    LaneClosed { lane: usize },
}

/// Sending side of every lane queue. Dropping it closes the queues; lanes
/// then drain what is buffered and stop.
pub struct LaneDispatcher {
    router: ShardRouter,
    lanes: Vec<mpsc::Sender<InventoryEvent>>,
}

/// Create `lane_count` bounded queues.
pub fn lanes(
    lane_count: usize,
    capacity: usize,
) -> (LaneDispatcher, Vec<mpsc::Receiver<InventoryEvent>>) {
    let router = ShardRouter::new(lane_count);
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..router.lane_count())
        .map(|_| mpsc::channel(capacity.max(1)))
        .unzip();
    (
        LaneDispatcher {
            router,
            lanes: senders,
        },
        receivers,
    )
}

impl LaneDispatcher {
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn router(&self) -> ShardRouter {
        self.router
    }

    /// Enqueue `event` on its lane, waiting for space if the queue is full.
    ///
    /// Returns the lane index. Gives up if `cancel` fires first.
    pub async fn dispatch(
        &self,
        event: InventoryEvent,
        cancel: &CancellationToken,
    ) -> Result<usize, DispatchError> {
        let lane = self.router.route(&event.item_id);
        let sender = &self.lanes[lane];

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled { lane }),
            sent = sender.send(event) => match sent {
                Ok(()) => Ok(lane),
                Err(_) => Err(DispatchError::LaneClosed { lane }),
            },
        }
    }

    /// Close every lane queue. Buffered events are still delivered.
    pub fn close(self) {
        debug!(lanes = self.lanes.len(), "Closing lane queues");
    }
}

/// Counters reported by a lane once its queue is drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: usize,
    pub processed: u64,
    pub failed: u64,
}

/// The running lane tasks.
pub struct WorkerPool {
    workers: JoinSet<LaneReport>,
    lane_count: usize,
}

impl WorkerPool {
    /// Create the lane queues and start one worker per lane.
    pub fn start(
        processor: Arc<EventProcessor>,
        lane_count: usize,
        capacity: usize,
    ) -> (Self, LaneDispatcher) {
        let (dispatcher, receivers) = lanes(lane_count, capacity);
        (Self::spawn(processor, receivers), dispatcher)
    }

    /// Start one worker per receiver.
    pub fn spawn(
        processor: Arc<EventProcessor>,
        receivers: Vec<mpsc::Receiver<InventoryEvent>>,
    ) -> Self {
        let lane_count = receivers.len();
        let mut workers = JoinSet::new();
        for (lane, receiver) in receivers.into_iter().enumerate() {
            workers.spawn(run_lane(lane, processor.clone(), receiver));
        }
        info!(lanes = lane_count, "Worker pool started");
        Self {
            workers,
            lane_count,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    /// Wait for every lane to drain, up to `timeout`.
    ///
    /// Lanes still running at the deadline are aborted. Returns `true` if all
    /// lanes finished on their own.
    pub async fn join(mut self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.workers.join_next().await {
                match joined {
                    Ok(report) => debug!(
                        lane = report.lane,
                        processed = report.processed,
                        failed = report.failed,
                        "Lane joined"
                    ),
                    Err(e) => error!(error = %e, "Lane task failed"),
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = self.workers.len(),
                timeout_secs = timeout.as_secs(),
                "Lanes did not drain in time, forcing stop"
            );
            self.workers.shutdown().await;
        }
        drained
    }
}

/// Apply queued events in order until the queue is closed and empty.
async fn run_lane(
    lane: usize,
    processor: Arc<EventProcessor>,
    mut receiver: mpsc::Receiver<InventoryEvent>,
) -> LaneReport {
    let mut report = LaneReport {
        lane,
        ..LaneReport::default()
    };

    while let Some(event) = receiver.recv().await {
        report.processed += 1;
        match processor.process(&event).await {
            Ok(applied) => debug!(
                lane = lane,
                item_id = %event.item_id,
                event_type = %event.kind,
                attempts = applied.attempts,
                "Event processed"
            ),
            Err(e) => {
                report.failed += 1;
                error!(
                    lane = lane,
                    item_id = %event.item_id,
                    event_type = %event.kind,
                    error = %e,
                    "Event processing failed"
                );
            }
        }

        if report.processed % STATS_INTERVAL == 0 {
            let stats = processor.stats();
            info!(
                lane = lane,
                lane_processed = report.processed,
                applied = stats.applied,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                "Worker statistics"
            );
        }
    }

    info!(
        lane = lane,
        processed = report.processed,
        failed = report.failed,
        "Lane drained"
    );
    report
}
