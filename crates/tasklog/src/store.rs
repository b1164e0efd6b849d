// Storage seam: the append-only-log primitives the queue is built on.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Storage-level failure. Queue callers treat any of these as transient.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("log storage error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("log storage error: {reason}")]
    Internal { reason: String },
}

/// One record read back from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

/// Append-only log with consumer groups.
///
/// Models the stream primitives (`XADD`, `XREADGROUP`, `XACK`+`XDEL`,
/// `XRANGE`, `XLEN`, `XGROUP CREATE MKSTREAM`) plus the plain key/value pair
/// the backoff gate shares with the queue. Implementations: [`RedisStore`]
/// for production, [`MemoryStore`] for tests and one-shot runs.
///
/// [`RedisStore`]: crate::RedisStore
/// [`MemoryStore`]: crate::MemoryStore
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Appends a record, returning its assigned id.
    async fn add(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<String, StoreError>;

    /// Number of records currently in the stream.
    async fn len(&self, key: &str) -> Result<u64, StoreError>;

    /// Creates the consumer group at the stream head, creating the stream if
    /// needed. Succeeds if the group already exists.
    async fn create_group(&self, key: &str, group: &str) -> Result<(), StoreError>;

    /// Reads previously delivered but unacknowledged records, oldest first.
    async fn read_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Reads records never delivered to the group, blocking up to `block`.
    async fn read_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledges and deletes a record in one transaction.
    async fn ack_delete(&self, key: &str, group: &str, id: &str) -> Result<(), StoreError>;

    /// Range-reads a single record by id.
    async fn get(&self, key: &str, id: &str) -> Result<Option<StreamEntry>, StoreError>;

    /// Plain key/value set.
    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Plain key/value get.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;
}
