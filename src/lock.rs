//! Distributed per-item leases.
//!
//! Update and Delete mutations run under a lease on `lock:inventory:<item_id>`
//! so that two consumer instances never mutate the same item at once. A lease
//! is a set-if-absent key with a TTL: if the holder dies without releasing,
//! the key expires on its own.
//!
//! # Example
//!
//! ```rust,ignore
//! use inventory_sync::lock::LockService;
//!
//! let locks = LockService::new(kv);
//! let rows = locks
//!     .with_lease("A1", async { store.increment("A1", -3).await })
//!     .await??;
//! ```
//!
//! [`LockService::with_lease`] always releases the lease once the critical
//! section finishes. If the critical section never finishes (panic, dropped
//! future) the [`LeaseGuard`] releases from `Drop` in the background.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::cache_key;
use crate::kv::{KeyValueStore, KvError};

/// Value stored under a held lock key.
pub const LOCK_SENTINEL: &str = "locked";

/// Default lease lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Lock key guarding an item.
pub fn lock_key(item_id: &str) -> String {
    format!("lock:{}", cache_key(item_id))
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lease.
    #[error("lock '{key}' is already held")]
    Held { key: String },

    #[error("lock backend error: {0}")]
    Backend(#[from] KvError),
}

/// Issues leases against the shared key-value store.
#[derive(Clone)]
pub struct LockService {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl LockService {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_ttl(kv, DEFAULT_LOCK_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lease for `item_id`. Never waits for a held lease.
    pub async fn acquire(&self, item_id: &str) -> Result<LeaseGuard, LockError> {
        let key = lock_key(item_id);
        if self.kv.set_if_absent(&key, LOCK_SENTINEL, self.ttl).await? {
            debug!(lock_key = %key, ttl_ms = self.ttl.as_millis() as u64, "Lease acquired");
            Ok(LeaseGuard {
                kv: self.kv.clone(),
                key,
                released: false,
            })
        } else {
            Err(LockError::Held { key })
        }
    }

    /// Run `critical` while holding the lease for `item_id`.
    ///
    /// `critical` is not polled unless the lease was acquired. The lease is
    /// released after it completes, whatever its output.
    pub async fn with_lease<F>(&self, item_id: &str, critical: F) -> Result<F::Output, LockError>
    where
        F: Future,
    {
        let lease = self.acquire(item_id).await?;
        let output = critical.await;
        lease.release().await;
        Ok(output)
    }
}

/// A held lease. Release it with [`LeaseGuard::release`].
pub struct LeaseGuard {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the lock key. Failures are logged; the TTL is the backstop.
    pub async fn release(mut self) {
        self.released = true;
        match self.kv.delete(&self.key).await {
            Ok(_) => debug!(lock_key = %self.key, "Lease released"),
            Err(e) => warn!(
                lock_key = %self.key,
                error = %e,
                "Failed to release lease, relying on TTL expiry"
            ),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock_key = %self.key, "Lease dropped outside a runtime, left to expire");
            return;
        };

        let kv = self.kv.clone();
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = kv.delete(&key).await {
                warn!(lock_key = %key, error = %e, "Failed to release abandoned lease");
            }
        });
    }
}
