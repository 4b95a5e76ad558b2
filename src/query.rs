//! Synchronous inventory reads for the HTTP intake.
//!
//! Writes always go through the event stream. These lookups read the store
//! directly and never touch the cache.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{InventoryStore, StoreError};

/// Largest number of ids accepted by one batch lookup.
pub const MAX_BATCH_IDS: usize = 100;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("item id must not be empty")]
    EmptyId,

    #[error("too many ids requested: {requested} (max {max})")]
    TooManyIds { requested: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryItem {
    pub id: String,
    pub quantity: i64,
}

#[derive(Clone)]
pub struct InventoryQuery {
    store: Arc<dyn InventoryStore>,
}

impl InventoryQuery {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, item_id: &str) -> Result<Option<InventoryItem>, QueryError> {
        if item_id.is_empty() {
            return Err(QueryError::EmptyId);
        }
        let quantity = self.store.fetch_quantity(item_id).await?;
        Ok(quantity.map(|quantity| InventoryItem {
            id: item_id.to_string(),
            quantity,
        }))
    }

    /// Look up several items. Missing ids are left out; found items come
    /// back in request order.
    pub async fn get_many(&self, item_ids: &[String]) -> Result<Vec<InventoryItem>, QueryError> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = item_ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        if ids.len() > MAX_BATCH_IDS {
            return Err(QueryError::TooManyIds {
                requested: ids.len(),
                max: MAX_BATCH_IDS,
            });
        }

        let found: std::collections::HashMap<String, i64> =
            self.store.fetch_quantities(&ids).await?.into_iter().collect();

        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let quantity = *found.get(&id)?;
                Some(InventoryItem { id, quantity })
            })
            .collect())
    }
}

/// Split a comma-separated id list (`?ids=A1,B7`).
pub fn parse_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
