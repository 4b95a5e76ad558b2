//! Entity Store Gateway - the three mutating statements against Postgres,
//! plus the point reads served by the intake's inventory routes.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE inventory (
//!     id       TEXT PRIMARY KEY,
//!     quantity BIGINT NOT NULL
//! );
//! ```
//!
//! Deltas are applied unconditionally: nothing stops a quantity from going
//! negative. Update and Delete on a missing id affect zero rows and are not
//! errors.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store refused the statement (used by non-SQL backends).
    #[error("store rejected statement: {0}")]
    Rejected(String),
}

/// Statements against the inventory table.
///
/// The mutating calls are issued by the event processor and return the
/// number of rows affected.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Insert a new item. A duplicate id is an error.
    async fn insert(&self, item_id: &str, quantity: i64) -> Result<u64, StoreError>;

    /// Add `delta` to an item's quantity.
    async fn increment(&self, item_id: &str, delta: i64) -> Result<u64, StoreError>;

    async fn delete(&self, item_id: &str) -> Result<u64, StoreError>;

    /// Current quantity of an item, `None` if it does not exist.
    async fn fetch_quantity(&self, item_id: &str) -> Result<Option<i64>, StoreError>;

    /// `(id, quantity)` for every existing item among `item_ids`, in no
    /// particular order.
    async fn fetch_quantities(&self, item_ids: &[String])
        -> Result<Vec<(String, i64)>, StoreError>;
}

/// Postgres-backed [`InventoryStore`].
#[derive(Clone)]
pub struct PgInventoryStore {
    pool: PgPool,
}

impl PgInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool. Avoid logging `url`, it may carry credentials.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn insert(&self, item_id: &str, quantity: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("INSERT INTO inventory (id, quantity) VALUES ($1, $2)")
            .bind(item_id)
            .bind(quantity)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn increment(&self, item_id: &str, delta: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE inventory SET quantity = quantity + $1 WHERE id = $2")
            .bind(delta)
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        let rows = result.rows_affected();
        if rows == 0 {
            debug!(item_id = %item_id, "Update matched no rows");
        }
        Ok(rows)
    }

    async fn delete(&self, item_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM inventory WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;

        let rows = result.rows_affected();
        if rows == 0 {
            debug!(item_id = %item_id, "Delete matched no rows");
        }
        Ok(rows)
    }

    async fn fetch_quantity(&self, item_id: &str) -> Result<Option<i64>, StoreError> {
        let quantity = sqlx::query_scalar::<_, i64>("SELECT quantity FROM inventory WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(quantity)
    }

    async fn fetch_quantities(
        &self,
        item_ids: &[String],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT id, quantity FROM inventory WHERE id = ANY($1)",
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
