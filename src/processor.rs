//! Event Processor - applies one event to the store, with retries.
//!
//! # Flow
//!
//! ```text
//! InventoryEvent
//!     │
//!     ├─ create ──────────────► INSERT ─► invalidate cache
//!     ├─ update ─► lease ─────► UPDATE ─► invalidate cache ─► release
//!     ├─ delete ─► lease ─────► DELETE ─► invalidate cache ─► release
//!     └─ other ──► dropped (no retry, no dead-letter)
//!
//! any failure ─► wait, retry (max 3 attempts) ─► dead-letter stream
//! ```
//!
//! All attempts run on the caller's task, so a retrying event holds its lane
//! until it resolves. Retry delays are not interrupted by shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::CacheInvalidator;
use crate::dlq::DeadLetterQueue;
use crate::event::{EventKind, InventoryEvent};
use crate::kv::KeyValueStore;
use crate::lock::{LockError, LockService};
use crate::store::{InventoryStore, StoreError};

/// Default number of attempts per event.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fixed-delay retry budget. No backoff growth, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is raised to at least one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Why a single attempt failed. Every variant is retryable.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Terminal outcome of processing an event.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown event type '{0}'")]
    UnknownKind(String),

    #[error("gave up after {attempts} attempt(s) (dead-lettered: {dead_lettered}): {last}")]
    Exhausted {
        attempts: u32,
        dead_lettered: bool,
        #[source]
        last: MutationError,
    },
}

/// A successfully applied event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Attempt number that succeeded (1-based).
    pub attempts: u32,

    pub rows_affected: u64,

    /// Whether the cache delete went through.
    pub cache_invalidated: bool,
}

/// What to do with an event once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Republish to the dead-letter stream (primary path).
    DeadLetter,
    /// Log only (dead-letter replay path).
    LogOnly,
}

/// The store statement an event maps to. Unknown kinds map to none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Insert(i64),
    Increment(i64),
    Delete,
}

impl Mutation {
    fn for_event(event: &InventoryEvent) -> Option<Self> {
        match event.kind {
            EventKind::Create => Some(Mutation::Insert(event.quantity)),
            EventKind::Update => Some(Mutation::Increment(event.quantity)),
            EventKind::Delete => Some(Mutation::Delete),
            EventKind::Unknown(_) => None,
        }
    }

    /// Inserts run without the per-item lease.
    fn requires_lease(self) -> bool {
        !matches!(self, Mutation::Insert(_))
    }
}

/// Collaborators the processor mutates through.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub store: Arc<dyn InventoryStore>,
    pub locks: LockService,
    pub cache: CacheInvalidator,
    pub dead_letters: DeadLetterQueue,
}

impl ProcessorDeps {
    /// Build the bundle with leases and cache sharing one key-value store.
    pub fn new(
        store: Arc<dyn InventoryStore>,
        kv: Arc<dyn KeyValueStore>,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        Self {
            store,
            locks: LockService::new(kv.clone()),
            cache: CacheInvalidator::new(kv),
            dead_letters,
        }
    }

    pub fn with_locks(mut self, locks: LockService) -> Self {
        self.locks = locks;
        self
    }
}

/// Running totals across every lane and the replay loop.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    applied: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    replay_failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub applied: u64,
    /// Events from the primary stream that used up their attempts
    pub failed: u64,
    pub dead_lettered: u64,
    /// Dead-lettered events whose replay failed again
    pub replay_failed: u64,
    pub dropped: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            replay_failed: self.replay_failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct EventProcessor {
    deps: ProcessorDeps,
    retry: RetryPolicy,
    stats: ProcessorStats,
}

impl EventProcessor {
    pub fn new(deps: ProcessorDeps, retry: RetryPolicy) -> Self {
        Self {
            deps,
            retry,
            stats: ProcessorStats::default(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Process an event from the primary stream, dead-lettering it if every
    /// attempt fails.
    pub async fn process(&self, event: &InventoryEvent) -> Result<Applied, ProcessError> {
        self.process_with(event, Escalation::DeadLetter).await
    }

    /// Process an event read back from the dead-letter stream. Failure is
    /// final.
    pub async fn replay(&self, event: &InventoryEvent) -> Result<Applied, ProcessError> {
        self.process_with(event, Escalation::LogOnly).await
    }

    pub async fn process_with(
        &self,
        event: &InventoryEvent,
        escalation: Escalation,
    ) -> Result<Applied, ProcessError> {
        let Some(mutation) = Mutation::for_event(event) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(item_id = %event.item_id, event_type = %event.kind, "Dropping event of unknown type");
            return Err(ProcessError::UnknownKind(event.kind.to_string()));
        };

        let max_attempts = self.retry.max_attempts;
        let mut attempt = 1;
        let last = loop {
            match self.attempt(&event.item_id, mutation).await {
                Ok((rows_affected, cache_invalidated)) => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        item_id = %event.item_id,
                        event_type = %event.kind,
                        attempt = attempt,
                        rows_affected = rows_affected,
                        "Event applied"
                    );
                    return Ok(Applied {
                        attempts: attempt,
                        rows_affected,
                        cache_invalidated,
                    });
                }
                Err(e) => {
                    warn!(
                        item_id = %event.item_id,
                        event_type = %event.kind,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    if attempt >= max_attempts {
                        break e;
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        };

        let dead_lettered = match escalation {
            Escalation::DeadLetter => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.dead_letter(event).await
            }
            Escalation::LogOnly => {
                self.stats.replay_failed.fetch_add(1, Ordering::Relaxed);
                info!(item_id = %event.item_id, "Not dead-lettering a replayed event");
                false
            }
        };

        Err(ProcessError::Exhausted {
            attempts: max_attempts,
            dead_lettered,
            last,
        })
    }

    async fn dead_letter(&self, event: &InventoryEvent) -> bool {
        match self.deps.dead_letters.publish(event).await {
            Ok(_) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!(
                    item_id = %event.item_id,
                    error = %e,
                    "Failed to publish event to dead-letter stream"
                );
                false
            }
        }
    }

    /// One attempt: mutate, then invalidate the cache on success.
    async fn attempt(
        &self,
        item_id: &str,
        mutation: Mutation,
    ) -> Result<(u64, bool), MutationError> {
        let store = &self.deps.store;

        let mutate = async {
            let rows = match mutation {
                Mutation::Insert(quantity) => store.insert(item_id, quantity).await?,
                Mutation::Increment(delta) => store.increment(item_id, delta).await?,
                Mutation::Delete => store.delete(item_id).await?,
            };
            let invalidated = self.deps.cache.invalidate(item_id).await;
            Ok::<_, StoreError>((rows, invalidated))
        };

        if mutation.requires_lease() {
            Ok(self.deps.locks.with_lease(item_id, mutate).await??)
        } else {
            Ok(mutate.await?)
        }
    }
}
