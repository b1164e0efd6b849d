//! Durable task queue over an append-only log with consumer groups.
//!
//! Each task kind lives in its own stream keyed `task.<scope>.<name>`.
//! Records carry their own delay and timeout: a record is runnable once
//! `created + delay` has passed and is evicted unexecuted once
//! `created + delay + timeout` has passed. Delivery is at-least-once within
//! a single consumer group; acknowledging deletes the record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{StoreError, StreamEntry, StreamStore};

const GROUP: &str = "tasks";
const CONSUMER: &str = "dequeue";

const FIELD_CREATED: &str = "created";
const FIELD_DELAY: &str = "delay";
const FIELD_TIMEOUT: &str = "timeout";
const FIELD_DATA: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum TaskLogError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("task payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable per-kind task queue.
pub struct TaskLog {
    store: Arc<dyn StreamStore>,
    scope: String,
    // Group creation memoised per process.
    groups: Mutex<HashSet<String>>,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn field_i64(entry: &StreamEntry, name: &str) -> Option<i64> {
    let raw = entry.fields.get(name)?;
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

enum Disposition<T> {
    Runnable(String, T),
    /// Delay not yet elapsed; runnable after this long.
    Wait(Duration),
    /// Expired and evicted, or poison: nothing to run.
    Skip,
}

impl TaskLog {
    pub fn new(store: Arc<dyn StreamStore>, scope: impl Into<String>) -> Self {
        TaskLog {
            store,
            scope: scope.into(),
            groups: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    fn key(&self, name: &str) -> String {
        format!("task.{}.{}", self.scope, name)
    }

    /// Appends a task record. Returns the assigned id and the number of
    /// records already in the stream before the append (for backpressure).
    pub async fn enqueue<T: Serialize>(
        &self,
        name: &str,
        payload: &T,
        delay: Duration,
        timeout: Duration,
    ) -> Result<(String, u64), TaskLogError> {
        let key = self.key(name);
        let pending = self.store.len(&key).await?;

        let data = serde_json::to_vec(payload)?;
        let fields: [(&str, Vec<u8>); 4] = [
            (FIELD_CREATED, now_nanos().to_string().into_bytes()),
            (
                FIELD_DELAY,
                (delay.as_nanos() as i64).to_string().into_bytes(),
            ),
            (
                FIELD_TIMEOUT,
                (timeout.as_nanos() as i64).to_string().into_bytes(),
            ),
            (FIELD_DATA, data),
        ];

        let id = self.store.add(&key, &fields).await?;
        debug!(%key, %id, "task enqueued");

        Ok((id, pending))
    }

    async fn ensure_group(&self, key: &str) -> Result<(), TaskLogError> {
        if self.groups.lock().unwrap().contains(key) {
            return Ok(());
        }

        self.store.create_group(key, GROUP).await?;
        self.groups.lock().unwrap().insert(key.to_owned());

        Ok(())
    }

    /// Classifies one delivered record, evicting it when expired.
    ///
    /// Records with unparseable headers or payloads are skipped without
    /// acknowledgment: poison never blocks the stream, and the timeout
    /// mechanism eventually evicts it.
    async fn disposition<T: DeserializeOwned>(
        &self,
        key: &str,
        entry: StreamEntry,
    ) -> Result<Disposition<T>, TaskLogError> {
        let (Some(created), Some(delay), Some(timeout)) = (
            field_i64(&entry, FIELD_CREATED),
            field_i64(&entry, FIELD_DELAY),
            field_i64(&entry, FIELD_TIMEOUT),
        ) else {
            warn!(key, id = %entry.id, "skipping task with malformed header");
            return Ok(Disposition::Skip);
        };

        let passed = now_nanos().saturating_sub(created);

        if passed < delay {
            return Ok(Disposition::Wait(Duration::from_nanos(
                (delay - passed) as u64,
            )));
        }

        if timeout > 0 && passed - delay > timeout {
            self.store.ack_delete(key, GROUP, &entry.id).await?;
            debug!(key, id = %entry.id, "expired task evicted");
            return Ok(Disposition::Skip);
        }

        let Some(data) = entry.fields.get(FIELD_DATA) else {
            warn!(key, id = %entry.id, "skipping task without payload");
            return Ok(Disposition::Skip);
        };

        match serde_json::from_slice(data) {
            Ok(payload) => Ok(Disposition::Runnable(entry.id, payload)),
            Err(e) => {
                warn!(key, id = %entry.id, error = %e, "skipping undecodable task");
                Ok(Disposition::Skip)
            }
        }
    }

    async fn scan<T: DeserializeOwned>(
        &self,
        key: &str,
        entries: Vec<StreamEntry>,
        min_wait: &mut Option<Duration>,
    ) -> Result<Option<(String, T)>, TaskLogError> {
        for entry in entries {
            match self.disposition(key, entry).await? {
                Disposition::Runnable(id, payload) => return Ok(Some((id, payload))),
                Disposition::Wait(wait) => {
                    let shorter = min_wait.is_none_or(|current| wait < current);
                    if shorter {
                        *min_wait = Some(wait);
                    }
                }
                Disposition::Skip => {}
            }
        }

        Ok(None)
    }

    /// Returns the next runnable task, blocking up to `block_max`.
    ///
    /// Previously delivered but unacknowledged records are examined first,
    /// in insertion order; then new records, blocking no longer than the
    /// earliest pending delay. `None` means nothing became runnable in time.
    pub async fn dequeue<T: DeserializeOwned>(
        &self,
        name: &str,
        block_max: Duration,
    ) -> Result<Option<(String, T)>, TaskLogError> {
        let key = self.key(name);
        self.ensure_group(&key).await?;

        let mut min_wait = None;

        let pending = self.store.read_pending(&key, GROUP, CONSUMER).await?;
        if let Some(found) = self.scan(&key, pending, &mut min_wait).await? {
            return Ok(Some(found));
        }

        let block = min_wait.map_or(block_max, |wait| block_max.min(wait));
        let fresh = self.store.read_new(&key, GROUP, CONSUMER, block).await?;
        if let Some(found) = self.scan(&key, fresh, &mut min_wait).await? {
            return Ok(Some(found));
        }

        // Everything seen was still delayed: sleep the shortest delay out
        // and re-examine what is now pending.
        if let Some(wait) = min_wait {
            tokio::time::sleep(wait).await;

            let mut ignored = None;
            let pending = self.store.read_pending(&key, GROUP, CONSUMER).await?;
            return self.scan(&key, pending, &mut ignored).await;
        }

        Ok(None)
    }

    /// Acknowledges and deletes a record in one transaction.
    pub async fn ack(&self, name: &str, id: &str) -> Result<(), TaskLogError> {
        let key = self.key(name);
        self.store.ack_delete(&key, GROUP, id).await?;

        Ok(())
    }

    /// Probes a single record by id. `None` when absent or undecodable.
    pub async fn get<T: DeserializeOwned>(
        &self,
        name: &str,
        id: &str,
    ) -> Result<Option<T>, TaskLogError> {
        let key = self.key(name);

        let Some(entry) = self.store.get(&key, id).await? else {
            return Ok(None);
        };

        let Some(data) = entry.fields.get(FIELD_DATA) else {
            return Ok(None);
        };

        Ok(serde_json::from_slice(data).ok())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        url: String,
        format: String,
    }

    fn job(url: &str) -> Job {
        Job {
            url: url.to_owned(),
            format: "max".to_owned(),
        }
    }

    fn log() -> TaskLog {
        TaskLog::new(Arc::new(MemoryStore::new()), "nico")
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack_round_trip() {
        let log = log();

        let (id, pending) = log
            .enqueue("download", &job("sm1"), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(pending, 0);

        let (got_id, got): (String, Job) = log
            .dequeue("download", Duration::from_millis(100))
            .await
            .unwrap()
            .expect("task should be runnable");
        assert_eq!(got_id, id);
        assert_eq!(got, job("sm1"));

        log.ack("download", &id).await.unwrap();
        let probe: Option<Job> = log.get("download", &id).await.unwrap();
        assert!(probe.is_none());
    }

    #[tokio::test]
    async fn delayed_task_not_observed_before_delay() {
        let log = log();
        let start = Instant::now();

        log.enqueue(
            "download",
            &job("sm1"),
            Duration::from_millis(500),
            Duration::ZERO,
        )
        .await
        .unwrap();

        let got: Option<(String, Job)> = log
            .dequeue("download", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(got.is_some());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn expired_task_evicted_without_delivery() {
        let log = log();

        log.enqueue(
            "download",
            &job("sm1"),
            Duration::ZERO,
            Duration::from_nanos(1),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let got: Option<(String, Job)> = log
            .dequeue("download", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());

        // The eviction is ack+delete: the stream record is gone.
        let len = log.store().len("task.nico.download").await.unwrap();
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn unacked_task_redelivered_from_pending() {
        let log = log();

        let (id, _) = log
            .enqueue("download", &job("sm1"), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        let first: Option<(String, Job)> = log
            .dequeue("download", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.unwrap().0, id);

        // Not acked: the same record comes back from the pending scan.
        let second: Option<(String, Job)> = log
            .dequeue("download", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second.unwrap().0, id);
    }

    #[tokio::test]
    async fn poison_record_skipped_silently() {
        let log = log();

        log.store()
            .add(
                "task.nico.download",
                &[
                    ("created", now_nanos().to_string().into_bytes()),
                    ("delay", b"0".to_vec()),
                    ("timeout", b"0".to_vec()),
                    ("data", b"{not json".to_vec()),
                ],
            )
            .await
            .unwrap();

        let (id, _) = log
            .enqueue("download", &job("sm2"), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        // The poison record is passed over; the decodable one is returned.
        let got: Option<(String, Job)> = log
            .dequeue("download", Duration::from_millis(50))
            .await
            .unwrap();
        let (got_id, payload) = got.unwrap();
        assert_eq!(got_id, id);
        assert_eq!(payload.url, "sm2");
    }

    #[tokio::test]
    async fn enqueue_reports_existing_count() {
        let log = log();

        for i in 0..3 {
            let (_, pending) = log
                .enqueue("list", &job("sm1"), Duration::ZERO, Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(pending, i);
        }
    }
}
