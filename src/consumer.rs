//! Inventory consumer - wires ingestion, lanes and dead-letter replay.
//!
//! ```text
//! primary stream ─► IngestionLoop ─► lanes ─► EventProcessor ─┬─► store
//!                                                             └─► dead-letter stream
//! dead-letter stream ─► DeadLetterConsumer ─► EventProcessor (replay)
//! ```
//!
//! All three loops share one cancellation token. Shutdown stops the pulls,
//! lets the lanes drain what is buffered and gives up at a single deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dlq::{DeadLetterConsumer, ReplayReport};
use crate::ingest::{IngestReport, IngestionLoop};
use crate::pool::{WorkerPool, DEFAULT_LANES, DEFAULT_QUEUE_CAPACITY};
use crate::processor::{EventProcessor, StatsSnapshot};
use crate::stream::StreamReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub lanes: usize,
    pub queue_capacity: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            lanes: DEFAULT_LANES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct InventoryConsumer {
    processor: Arc<EventProcessor>,
    primary: Box<dyn StreamReader>,
    dead_letters: Box<dyn StreamReader>,
    settings: ConsumerSettings,
}

impl InventoryConsumer {
    pub fn new(
        processor: Arc<EventProcessor>,
        primary: Box<dyn StreamReader>,
        dead_letters: Box<dyn StreamReader>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            processor,
            primary,
            dead_letters,
            settings,
        }
    }

    /// Start the lanes, the ingestion loop and the replay loop.
    pub fn start(self, cancel: CancellationToken) -> RunningConsumer {
        let (workers, dispatcher) = WorkerPool::start(
            self.processor.clone(),
            self.settings.lanes,
            self.settings.queue_capacity,
        );
        let ingestion = IngestionLoop::new(self.primary, dispatcher).spawn(cancel.clone());
        let replay =
            DeadLetterConsumer::new(self.dead_letters, self.processor.clone()).spawn(cancel.clone());

        info!(
            lanes = workers.lane_count(),
            queue_capacity = self.settings.queue_capacity,
            "Inventory consumer started"
        );

        RunningConsumer {
            cancel,
            processor: self.processor,
            ingestion,
            workers,
            replay,
        }
    }
}

/// Outcome of [`RunningConsumer::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every loop stopped before the deadline.
    pub graceful: bool,
    pub ingest: Option<IngestReport>,
    pub replay: Option<ReplayReport>,
    pub stats: StatsSnapshot,
}

pub struct RunningConsumer {
    cancel: CancellationToken,
    processor: Arc<EventProcessor>,
    ingestion: JoinHandle<IngestReport>,
    workers: WorkerPool,
    replay: JoinHandle<ReplayReport>,
}

impl RunningConsumer {
    pub fn stats(&self) -> StatsSnapshot {
        self.processor.stats()
    }

    /// Cancel every loop and wait for them, all within `timeout`.
    ///
    /// Lanes finish the events already buffered. Anything still running at
    /// the deadline is aborted.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        info!(timeout_secs = timeout.as_secs(), "Stopping inventory consumer");

        let ingest = join_by(self.ingestion, deadline, "ingestion").await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let lanes_drained = self.workers.join(remaining).await;

        let replay = join_by(self.replay, deadline, "dead-letter replay").await;

        let stats = self.processor.stats();
        let graceful = ingest.is_some() && lanes_drained && replay.is_some();
        if graceful {
            info!(
                applied = stats.applied,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                replay_failed = stats.replay_failed,
                dropped = stats.dropped,
                "Inventory consumer stopped"
            );
        } else {
            warn!(
                applied = stats.applied,
                failed = stats.failed,
                "Inventory consumer forced to stop at shutdown deadline"
            );
        }

        ShutdownReport {
            graceful,
            ingest,
            replay,
            stats,
        }
    }
}

async fn join_by<T>(mut handle: JoinHandle<T>, deadline: Instant, task: &str) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            error!(task = task, error = %e, "Task failed");
            None
        }
        Err(_) => {
            warn!(task = task, "Task did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DeadLetterQueue;
    use crate::event::InventoryEvent;
    use crate::lock::{lock_key, LOCK_SENTINEL};
    use crate::processor::{ProcessorDeps, RetryPolicy};
    use crate::stream::StreamWriter;
    use crate::testing::{memory_stream, wait_until, MemoryKv, MemoryStore, StoreOp};

    async fn publish(writer: &impl StreamWriter, event: InventoryEvent) {
        writer
            .publish(&event.item_id, event.encode().unwrap().as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_events_applied_in_order_per_key() {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let (dlq_writer, dlq_reader) = memory_stream();
        let deps = ProcessorDeps::new(
            store.clone(),
            kv.clone(),
            DeadLetterQueue::new(Arc::new(dlq_writer)),
        );
        let processor = Arc::new(EventProcessor::new(
            deps,
            RetryPolicy::new(3, Duration::from_millis(1)),
        ));

        let (writer, reader) = memory_stream();
        let consumer = InventoryConsumer::new(
            processor,
            Box::new(reader),
            Box::new(dlq_reader),
            ConsumerSettings::default(),
        );
        let cancel = CancellationToken::new();
        let running = consumer.start(cancel.clone());

        publish(&writer, InventoryEvent::create("A1", 10)).await;
        publish(&writer, InventoryEvent::create("B7", 1)).await;
        publish(&writer, InventoryEvent::update("A1", -3)).await;
        publish(&writer, InventoryEvent::update("B7", 4)).await;
        publish(&writer, InventoryEvent::delete("B7")).await;

        assert!(wait_until(Duration::from_secs(2), || store.attempts() == 5).await);

        let report = running.shutdown(Duration::from_secs(2)).await;
        assert!(report.graceful);
        assert_eq!(report.stats.applied, 5);
        assert_eq!(report.ingest.map(|r| r.dispatched), Some(5));

        assert_eq!(store.quantity("A1"), Some(7));
        assert_eq!(store.quantity("B7"), None);
        let b7: Vec<StoreOp> = store
            .ops()
            .into_iter()
            .filter(|op| op.item_id() == "B7")
            .collect();
        assert_eq!(
            b7,
            vec![
                StoreOp::Insert("B7".into(), 1),
                StoreOp::Increment("B7".into(), 4),
                StoreOp::Delete("B7".into()),
            ]
        );
        assert!(!kv.contains(&lock_key("A1")));
    }

    #[tokio::test]
    async fn test_held_lock_sends_update_to_dead_letters() {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        kv.insert(&lock_key("A1"), LOCK_SENTINEL);

        let (dlq_writer, dlq_reader) = memory_stream();
        let deps = ProcessorDeps::new(
            store.clone(),
            kv.clone(),
            DeadLetterQueue::new(Arc::new(dlq_writer.clone())),
        );
        let processor = Arc::new(EventProcessor::new(
            deps,
            RetryPolicy::new(3, Duration::from_millis(1)),
        ));

        let (writer, reader) = memory_stream();
        let running = InventoryConsumer::new(
            processor,
            Box::new(reader),
            Box::new(dlq_reader),
            ConsumerSettings {
                lanes: 2,
                queue_capacity: 4,
            },
        )
        .start(CancellationToken::new());

        publish(&writer, InventoryEvent::update("A1", 5)).await;

        // Dead-lettered once, then replayed once (lock still held), then dropped
        assert!(wait_until(Duration::from_secs(2), || running.stats().replay_failed == 1).await);

        let report = running.shutdown(Duration::from_secs(2)).await;
        assert!(report.graceful);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.dead_lettered, 1);
        assert_eq!(report.stats.replay_failed, 1);
        assert_eq!(report.replay.map(|r| r.failed), Some(1));
        assert_eq!(store.attempts(), 0);

        let dead = dlq_writer.published();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key.as_deref(), Some("A1"));
        assert_eq!(
            InventoryEvent::decode(&dead[0].payload).unwrap(),
            InventoryEvent::update("A1", 5)
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_timeout() {
        let store = Arc::new(MemoryStore::new());
        store.fail_always(true);
        let (dlq_writer, dlq_reader) = memory_stream();
        let deps = ProcessorDeps::new(
            store.clone(),
            Arc::new(MemoryKv::new()),
            DeadLetterQueue::new(Arc::new(dlq_writer)),
        );
        let processor = Arc::new(EventProcessor::new(
            deps,
            RetryPolicy::new(3, Duration::from_secs(30)),
        ));

        let (writer, reader) = memory_stream();
        let running = InventoryConsumer::new(
            processor,
            Box::new(reader),
            Box::new(dlq_reader),
            ConsumerSettings::default(),
        )
        .start(CancellationToken::new());

        publish(&writer, InventoryEvent::create("A1", 1)).await;
        assert!(wait_until(Duration::from_secs(2), || store.attempts() == 1).await);

        let started = Instant::now();
        let report = running.shutdown(Duration::from_millis(100)).await;
        assert!(!report.graceful);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
