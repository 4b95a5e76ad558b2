//! Cache invalidation (invalidate-on-write).
//!
//! After every successful mutation the consumer deletes the derived cache
//! entry for the item. It never writes cache values; repopulation is the read
//! path's job. A failed delete is logged and otherwise ignored: the mutation
//! has already committed and the entry is at worst stale until the next write.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

/// Prefix of derived cache keys.
pub const CACHE_KEY_PREFIX: &str = "inventory:";

/// Cache key for an item.
pub fn cache_key(item_id: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, item_id)
}

#[derive(Clone)]
pub struct CacheInvalidator {
    kv: Arc<dyn KeyValueStore>,
}

impl CacheInvalidator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Delete the cache entry for `item_id`.
    ///
    /// Returns `false` if the delete failed; the caller must not treat that
    /// as a failed event.
    pub async fn invalidate(&self, item_id: &str) -> bool {
        let key = cache_key(item_id);
        match self.kv.delete(&key).await {
            Ok(removed) => {
                debug!(cache_key = %key, removed = removed, "Cache entry invalidated");
                true
            }
            Err(e) => {
                warn!(
                    cache_key = %key,
                    item_id = %item_id,
                    error = %e,
                    "Failed to invalidate cache entry"
                );
                false
            }
        }
    }
}
