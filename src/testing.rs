//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::kv::{KeyValueStore, KvError};
use crate::store::{InventoryStore, StoreError};
use crate::stream::{StreamError, StreamMessage, StreamReader, StreamWriter};

/// A call observed by [`MemoryKv`]. Sets are recorded only when they take
/// the key; deletes are recorded on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Set(String),
    Delete(String),
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    ops: Mutex<Vec<KvOp>>,
    fail_sets: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key with no expiry.
    pub fn insert(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), None));
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        matches!(entries.get(key), Some((_, expiry)) if !is_expired(*expiry))
    }

    pub fn ops(&self) -> Vec<KvOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

fn is_expired(expiry: Option<Instant>) -> bool {
    expiry.is_some_and(|at| Instant::now() >= at)
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(KvError::ConnectionError("injected failure".into()));
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some((_, expiry)) = entries.get(key) {
            if !is_expired(*expiry) {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        self.ops.lock().unwrap().push(KvOp::Set(key.to_string()));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        self.ops.lock().unwrap().push(KvOp::Delete(key.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(KvError::CommandError("injected failure".into()));
        }

        let removed = self.entries.lock().unwrap().remove(key);
        Ok(u64::from(matches!(removed, Some((_, expiry)) if !is_expired(expiry))))
    }
}

/// A statement observed by [`MemoryStore`], including failed ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Insert(String, i64),
    Increment(String, i64),
    Delete(String),
}

impl StoreOp {
    pub fn item_id(&self) -> &str {
        match self {
            StoreOp::Insert(id, _) | StoreOp::Increment(id, _) | StoreOp::Delete(id) => id,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, i64>>,
    ops: Mutex<Vec<StoreOp>>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` statements.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    pub fn quantity(&self, item_id: &str) -> Option<i64> {
        self.rows.lock().unwrap().get(item_id).copied()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Number of statements issued, failed or not.
    pub fn attempts(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    fn record(&self, op: StoreOp) -> Result<(), StoreError> {
        self.ops.lock().unwrap().push(op);
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected failure".into()));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Rejected("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn insert(&self, item_id: &str, quantity: i64) -> Result<u64, StoreError> {
        self.record(StoreOp::Insert(item_id.to_string(), quantity))?;
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(item_id) {
            return Err(StoreError::Rejected(format!("duplicate key '{}'", item_id)));
        }
        rows.insert(item_id.to_string(), quantity);
        Ok(1)
    }

    async fn increment(&self, item_id: &str, delta: i64) -> Result<u64, StoreError> {
        self.record(StoreOp::Increment(item_id.to_string(), delta))?;
        match self.rows.lock().unwrap().get_mut(item_id) {
            Some(quantity) => {
                *quantity += delta;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, item_id: &str) -> Result<u64, StoreError> {
        self.record(StoreOp::Delete(item_id.to_string()))?;
        Ok(u64::from(self.rows.lock().unwrap().remove(item_id).is_some()))
    }

    // Reads are not statements the processor issues: not logged, never fail
    async fn fetch_quantity(&self, item_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.quantity(item_id))
    }

    async fn fetch_quantities(
        &self,
        item_ids: &[String],
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(item_ids
            .iter()
            .filter_map(|id| rows.get(id).map(|quantity| (id.clone(), *quantity)))
            .collect())
    }
}

/// Writer half of an in-memory stream. Keeps a log of everything published.
#[derive(Clone)]
pub struct MemoryStreamWriter {
    sender: mpsc::UnboundedSender<StreamMessage>,
    published: Arc<Mutex<Vec<StreamMessage>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStreamWriter {
    pub fn published(&self) -> Vec<StreamMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Push a raw payload without a key.
    pub fn push_raw(&self, payload: &[u8]) {
        let message = StreamMessage {
            id: self.allocate_id(),
            key: None,
            payload: payload.to_vec(),
        };
        self.published.lock().unwrap().push(message.clone());
        let _ = self.sender.send(message);
    }

    fn allocate_id(&self) -> String {
        format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl StreamWriter for MemoryStreamWriter {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<String, StreamError> {
        let message = StreamMessage {
            id: self.allocate_id(),
            key: Some(key.to_string()),
            payload: payload.to_vec(),
        };
        let id = message.id.clone();
        self.published.lock().unwrap().push(message.clone());
        self.sender.send(message).map_err(|_| StreamError::Closed)?;
        Ok(id)
    }
}

/// Reader half of an in-memory stream; reports [`StreamError::Closed`]
/// once every writer is dropped and the backlog is consumed.
pub struct MemoryStreamReader {
    receiver: mpsc::UnboundedReceiver<StreamMessage>,
}

#[async_trait]
impl StreamReader for MemoryStreamReader {
    async fn next_message(&mut self) -> Result<StreamMessage, StreamError> {
        self.receiver.recv().await.ok_or(StreamError::Closed)
    }
}

pub fn memory_stream() -> (MemoryStreamWriter, MemoryStreamReader) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        MemoryStreamWriter {
            sender,
            published: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        },
        MemoryStreamReader { receiver },
    )
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_semantics() {
        let store = MemoryStore::new();

        assert_eq!(store.insert("A1", 10).await.unwrap(), 1);
        assert!(matches!(
            store.insert("A1", 5).await,
            Err(StoreError::Rejected(_))
        ));

        assert_eq!(store.increment("A1", -13).await.unwrap(), 1);
        assert_eq!(store.fetch_quantity("A1").await.unwrap(), Some(-3));

        assert_eq!(store.increment("missing", 1).await.unwrap(), 0);
        assert_eq!(store.delete("missing").await.unwrap(), 0);
        assert_eq!(store.delete("A1").await.unwrap(), 1);
        assert_eq!(store.quantity("A1"), None);

        assert_eq!(
            store.ops(),
            vec![
                StoreOp::Insert("A1".into(), 10),
                StoreOp::Insert("A1".into(), 5),
                StoreOp::Increment("A1".into(), -13),
                StoreOp::Increment("missing".into(), 1),
                StoreOp::Delete("missing".into()),
                StoreOp::Delete("A1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(store.insert("A1", 1).await.is_err());
        assert!(store.insert("A1", 1).await.is_err());
        assert!(store.insert("A1", 1).await.is_ok());
        assert_eq!(store.attempts(), 3);
    }

    #[tokio::test]
    async fn test_memory_kv_ttl() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "v", Duration::from_millis(10)).await.unwrap());
        assert!(!kv.set_if_absent("k", "v", Duration::from_millis(10)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!kv.contains("k"));
        assert!(kv.set_if_absent("k", "v", Duration::from_secs(1)).await.unwrap());
    }
}
