//! # Inventory Sync
//!
//! An event-driven inventory mutation service. Mutation events (`create`,
//! `update`, `delete`) arrive on a Redis stream and are applied to Postgres by
//! a fixed set of single-threaded lanes, sharded by item id so that events for
//! one item are always applied in order.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP intake -> inventory.events -> IngestionLoop -> lanes -> EventProcessor
//!                                                                          │
//!                                  Postgres <── lease ── store ────────────┤
//!                                  Redis cache <── invalidate ─────────────┤
//!                                  inventory.events.dlq <── after retries ─┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Event wire format
//! - [`router`]: Key to lane mapping
//! - [`pool`] / [`ingest`]: Lanes and the stream reader feeding them
//! - [`processor`]: Retrying mutation logic
//! - [`lock`] / [`cache`] / [`kv`]: Per-item leases and cache invalidation
//! - [`dlq`]: Dead-letter publishing and replay
//! - [`consumer`]: Wiring and graceful shutdown
//! - [`query`]: Read-only inventory lookups for the intake

pub mod cache;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod ingest;
pub mod kv;
pub mod lock;
pub mod pool;
pub mod processor;
pub mod query;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use config::ServiceConfig;
pub use consumer::{ConsumerSettings, InventoryConsumer, RunningConsumer};
pub use event::{EventKind, InventoryEvent};
pub use processor::{EventProcessor, ProcessorDeps, RetryPolicy};
pub use router::ShardRouter;

/// Primary stream carrying inventory mutation events
pub const EVENT_STREAM_NAME: &str = "inventory.events";

/// Dead-letter stream for events that exhausted their retries
pub const DLQ_STREAM_NAME: &str = "inventory.events.dlq";

/// Default consumer group on the primary stream
pub const DEFAULT_CONSUMER_GROUP: &str = "inventory_consumers";

/// Default consumer group on the dead-letter stream
pub const DEFAULT_DLQ_GROUP: &str = "inventory_dlq_replayers";
