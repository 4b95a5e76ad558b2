//! Shared key-value store used for leases and cache invalidation.
//!
//! The consumer only needs two primitives from the key-value store:
//! set-if-absent with an expiry (lease acquisition) and unconditional
//! delete (lease release, cache invalidation).

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Errors from the key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    CommandError(String),
}

/// Minimal key-value interface backing [`crate::lock::LockService`] and
/// [`crate::cache::CacheInvalidator`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key` with `ttl` unless the key already exists.
    ///
    /// Returns `true` if the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete `key`, returning how many keys were removed.
    async fn delete(&self, key: &str) -> Result<u64, KvError>;
}

/// Redis-backed key-value store.
#[derive(Clone)]
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, KvError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            KvError::ConnectionError(e.to_string())
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;

        // SET key value NX PX ttl replies OK when set, nil when the key exists
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::CommandError(e.to_string()))?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::CommandError(e.to_string()))?;

        Ok(removed)
    }
}
