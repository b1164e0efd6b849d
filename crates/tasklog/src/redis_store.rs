// Redis streams implementation of the storage seam.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};

use crate::store::{StoreError, StreamEntry, StreamStore};

const GROUP_START: &str = "0";

/// [`StreamStore`] over Redis streams, multiplexed through a
/// [`ConnectionManager`] so every worker loop can hold a cheap clone.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(RedisStore { conn })
    }

    fn entries(reply: StreamReadReply) -> Result<Vec<StreamEntry>, StoreError> {
        let mut out = Vec::new();

        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());

                for (name, value) in id.map {
                    let bytes: Vec<u8> = redis::from_redis_value(&value)?;
                    fields.insert(name, bytes);
                }

                out.push(StreamEntry { id: id.id, fields });
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn add(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(key, "*", fields).await?;

        Ok(id)
    }

    async fn len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(key).await?;

        Ok(len)
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(key, group, GROUP_START)
            .await;

        match created {
            Ok(_) => Ok(()),
            // The group surviving a previous process is the common case.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default().group(group, consumer);
        let reply: StreamReadReply = conn.xread_options(&[key], &[GROUP_START], &opts).await?;

        Self::entries(reply)
    }

    async fn read_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();

        // BLOCK 0 would wait forever; sub-millisecond waits read without
        // blocking instead.
        let mut opts = StreamReadOptions::default().group(group, consumer);
        let millis = block.as_millis() as usize;
        if millis > 0 {
            opts = opts.block(millis);
        }

        let reply: StreamReadReply = conn.xread_options(&[key], &[">"], &opts).await?;

        Self::entries(reply)
    }

    async fn ack_delete(&self, key: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .xack(key, group, &[id])
            .ignore()
            .xdel(key, &[id])
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn get(&self, key: &str, id: &str) -> Result<Option<StreamEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply = conn.xrange(key, id, id).await?;

        let Some(first) = reply.ids.into_iter().next() else {
            return Ok(None);
        };

        let mut fields = HashMap::with_capacity(first.map.len());

        for (name, value) in first.map {
            let bytes: Vec<u8> = redis::from_redis_value(&value)?;
            fields.insert(name, bytes);
        }

        Ok(Some(StreamEntry {
            id: first.id,
            fields,
        }))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;

        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;

        Ok(value)
    }
}
