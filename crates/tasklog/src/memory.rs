// In-memory stream store for tests and one-shot runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::store::{StoreError, StreamEntry, StreamStore};

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeSet<u64>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(u64, HashMap<String, Vec<u8>>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, String>,
    next_seq: u64,
}

/// [`StreamStore`] backed by process memory.
///
/// Mirrors the stream semantics the queue relies on: insertion-ordered ids,
/// per-group delivery cursors, pending sets, and blocking reads.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_new(&self, key: &str, group: &str) -> Vec<StreamEntry> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stream) = inner.streams.get_mut(key) else {
            return Vec::new();
        };
        let Some(state) = stream.groups.get_mut(group) else {
            return Vec::new();
        };

        let mut out = Vec::new();

        for (seq, fields) in &stream.entries {
            if *seq > state.last_delivered {
                state.last_delivered = *seq;
                state.pending.insert(*seq);
                out.push(StreamEntry {
                    id: entry_id(*seq),
                    fields: fields.clone(),
                });
            }
        }

        out
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn add(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let seq = inner.next_seq;

        let map = fields
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();

        inner
            .streams
            .entry(key.to_owned())
            .or_default()
            .entries
            .push((seq, map));
        drop(inner);

        self.notify.notify_waiters();

        Ok(entry_id(seq))
    }

    async fn len(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();

        Ok(inner
            .streams
            .get(key)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .streams
            .entry(key.to_owned())
            .or_default()
            .groups
            .entry(group.to_owned())
            .or_default();

        Ok(())
    }

    async fn read_pending(
        &self,
        key: &str,
        group: &str,
        _consumer: &str,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(stream) = inner.streams.get(key) else {
            return Ok(Vec::new());
        };
        let Some(state) = stream.groups.get(group) else {
            return Ok(Vec::new());
        };

        let out = stream
            .entries
            .iter()
            .filter(|(seq, _)| state.pending.contains(seq))
            .map(|(seq, fields)| StreamEntry {
                id: entry_id(*seq),
                fields: fields.clone(),
            })
            .collect();

        Ok(out)
    }

    async fn read_new(
        &self,
        key: &str,
        group: &str,
        _consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before scanning so a concurrent add between
            // the scan and the wait cannot be missed.
            let notified = self.notify.notified();

            let found = self.collect_new(key, group);
            if !found.is_empty() {
                return Ok(found);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack_delete(&self, key: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let Some(seq) = parse_seq(id) else {
            return Ok(());
        };

        let mut inner = self.inner.lock().unwrap();
        let Some(stream) = inner.streams.get_mut(key) else {
            return Ok(());
        };

        if let Some(state) = stream.groups.get_mut(group) {
            state.pending.remove(&seq);
        }

        stream.entries.retain(|(s, _)| *s != seq);

        Ok(())
    }

    async fn get(&self, key: &str, id: &str) -> Result<Option<StreamEntry>, StoreError> {
        let Some(seq) = parse_seq(id) else {
            return Ok(None);
        };

        let inner = self.inner.lock().unwrap();
        let Some(stream) = inner.streams.get(key) else {
            return Ok(None);
        };

        Ok(stream
            .entries
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(s, fields)| StreamEntry {
                id: entry_id(*s),
                fields: fields.clone(),
            }))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().unwrap().kv.get(key).cloned())
    }
}
