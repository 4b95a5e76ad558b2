//! Inventory Worker - applies inventory mutation events.
//!
//! Consumes the primary event stream through sharded lanes, applies each
//! event to Postgres and replays the dead-letter stream.
//!
//! ## Configuration
//!
//! Read from `INVENTORY_CONFIG` (default `config/inventory.toml`), with
//! `${VAR}` substitution. `RUST_LOG` sets the log level (default "info").

use deadpool_redis::{Config, Runtime};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inventory_sync::config::ServiceConfig;
use inventory_sync::consumer::InventoryConsumer;
use inventory_sync::dlq::DeadLetterQueue;
use inventory_sync::kv::RedisKv;
use inventory_sync::lock::LockService;
use inventory_sync::processor::{EventProcessor, ProcessorDeps};
use inventory_sync::shutdown::ShutdownSignal;
use inventory_sync::store::PgInventoryStore;
use inventory_sync::stream::{RedisStreamReader, RedisStreamWriter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let config = ServiceConfig::load()?;
    let consumer_name = config.consumer_name();

    info!(
        consumer_name = %consumer_name,
        consumer_group = %config.streams.consumer_group,
        lanes = config.workers.lanes,
        "Inventory worker starting"
    );

    // Redis: streams, leases and cache share one pool
    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let store = PgInventoryStore::connect(
        &config.postgres.url,
        config.postgres.max_connections,
        config.acquire_timeout(),
    )
    .await?;
    info!(max_connections = config.postgres.max_connections, "Connected to Postgres");

    let primary = RedisStreamReader::connect(
        pool.clone(),
        config.streams.events.clone(),
        config.streams.consumer_group.clone(),
        consumer_name.clone(),
    )
    .await?;
    let dead_letter_reader = RedisStreamReader::connect(
        pool.clone(),
        config.streams.dead_letter.clone(),
        config.streams.dead_letter_group.clone(),
        consumer_name,
    )
    .await?;

    let dead_letter_writer = RedisStreamWriter::new(pool.clone(), config.streams.dead_letter.clone())
        .with_max_len(config.streams.max_len);

    let kv = Arc::new(RedisKv::new(pool));
    let deps = ProcessorDeps::new(
        Arc::new(store),
        kv.clone(),
        DeadLetterQueue::new(Arc::new(dead_letter_writer)),
    )
    .with_locks(LockService::with_ttl(kv, config.lock_ttl()));
    let processor = Arc::new(EventProcessor::new(deps, config.retry_policy()));

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::with_timeout(config.shutdown_timeout());

    let running = InventoryConsumer::new(
        processor,
        Box::new(primary),
        Box::new(dead_letter_reader),
        config.consumer_settings(),
    )
    .start(shutdown.token());

    info!(stream = %config.streams.events, "Listening for events");

    shutdown.wait().await;
    let report = running.shutdown(shutdown.timeout()).await;

    info!(
        graceful = report.graceful,
        applied = report.stats.applied,
        failed = report.stats.failed,
        dead_lettered = report.stats.dead_lettered,
        "Worker shutdown complete"
    );
    Ok(())
}
