//! Redis store implementation for Streamsmith.
//!
//! Queues map onto Redis Streams with one consumer group each. The atomic
//! operations run as Lua scripts so a dedup check and its insert, or an
//! acknowledgment and its delete, can never be split by another client.
//!
//! # Features
//!
//! - **Distributed**: any number of processes can consume the same queue
//! - **Failover**: consumer identities are bound to connection names, so a dead
//!   connection's pending entries are found and claimed by survivors
//! - **Persistent**: tasks and outcome lists survive process restarts

use super::{
    ConsumerInfo, CounterIncr, GroupRead, ListAppend, PendingEntry, ReadCursor, SharedStore,
    StoreConnector, StreamEntry, StreamStore,
};
use crate::config::RedisConfig;
use crate::error::{SmithError, SmithResult};
use crate::keys::QueueKeys;
use crate::task::RawTask;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, ErrorKind, FromRedisValue, Script, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

/// Reply shape of `XREADGROUP`: per stream, its entries. Fields are nil for
/// entries deleted while still pending.
type ReadReply = Vec<(String, Vec<(String, Option<Vec<(String, String)>>)>)>;

/// Pre-compiled Lua scripts for the atomic queue operations
#[derive(Debug)]
struct RedisScripts {
    /// Dedup-checked insert
    enqueue: Script,
    /// Insert the retry and drop the old entry
    requeue: Script,
    /// Release the dedup key and drop the entry
    dequeue: Script,
    /// Remove a consumer that still has nothing pending
    delete_idle_consumer: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("scripts/enqueue.lua")),
            requeue: Script::new(include_str!("scripts/requeue.lua")),
            dequeue: Script::new(include_str!("scripts/dequeue.lua")),
            delete_idle_consumer: Script::new(include_str!("scripts/delete_idle_consumer.lua")),
        }
    }

    fn all(&self) -> [&Script; 4] {
        [
            &self.enqueue,
            &self.requeue,
            &self.dequeue,
            &self.delete_idle_consumer,
        ]
    }
}

/// Opens [`RedisStore`] connections to one server.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
    config: RedisConfig,
}

impl RedisConnector {
    /// Create a connector; no connection is opened yet.
    pub fn new(config: RedisConfig) -> SmithResult<Self> {
        let client =
            Client::open(config.connection_string.as_str()).map_err(|e| SmithError::Store {
                message: format!("Failed to create Redis client: {}", e),
                source: Some(Box::new(e)),
            })?;

        Ok(Self { client, config })
    }

    /// Open a connection.
    pub async fn open(&self) -> SmithResult<RedisStore> {
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_millis(self.config.connection_timeout_ms))
            .set_response_timeout(Duration::from_millis(self.config.response_timeout_ms));

        let conn = timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            self.client
                .get_connection_manager_with_config(manager_config),
        )
        .await
        .map_err(|e| SmithError::Store {
            message: "Timed out connecting to Redis".to_string(),
            source: Some(Box::new(e)),
        })?
        .map_err(|e| SmithError::Store {
            message: format!("Failed to create Redis connection manager: {}", e),
            source: Some(Box::new(e)),
        })?;

        debug!("Connected to Redis at {}", self.config.connection_string);

        Ok(RedisStore {
            conn: RwLock::new(Some(conn)),
            scripts: RedisScripts::new(),
        })
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> SmithResult<SharedStore> {
        Ok(Arc::new(self.open().await?))
    }
}

/// One Redis connection.
pub struct RedisStore {
    /// `None` once released
    conn: RwLock<Option<ConnectionManager>>,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    async fn conn(&self) -> SmithResult<ConnectionManager> {
        self.conn.read().await.clone().ok_or(SmithError::Disconnected)
    }

    async fn enqueue_pipeline(
        &self,
        conn: &mut ConnectionManager,
        keys: &QueueKeys,
        tasks: &[RawTask],
    ) -> redis::RedisResult<Vec<Option<String>>> {
        let hash = self.scripts.enqueue.get_hash();
        let mut pipe = redis::pipe();
        for task in tasks {
            pipe.cmd("EVALSHA")
                .arg(hash)
                .arg(3)
                .arg(&keys.stream)
                .arg(&keys.dedup_set)
                .arg(keys.queue_names())
                .arg(&task.data)
                .arg(&task.dedup_key)
                .arg(task.retry_count)
                .arg(&keys.qname);
        }
        pipe.query_async(conn).await
    }
}

/// Names announced by the connections in a `CLIENT LIST` reply.
pub fn parse_client_names(client_list: &str) -> Vec<String> {
    client_list
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .find_map(|field| field.strip_prefix("name="))
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn info_field<T: FromRedisValue>(info: &HashMap<String, Value>, key: &str) -> SmithResult<T> {
    let value = info
        .get(key)
        .ok_or_else(|| SmithError::store(format!("XINFO CONSUMERS reply lacks '{key}'")))?;
    Ok(redis::from_redis_value(value)?)
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn load_scripts(&self) -> SmithResult<()> {
        let mut conn = self.conn().await?;
        for script in self.scripts.all() {
            let _: String = script.prepare_invoke().load_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn client_id(&self) -> SmithResult<u64> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("CLIENT")
            .arg("ID")
            .query_async(&mut conn)
            .await?)
    }

    async fn set_client_name(&self, name: &str) -> SmithResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn client_names(&self) -> SmithResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let list: String = redis::cmd("CLIENT")
            .arg("LIST")
            .query_async(&mut conn)
            .await?;
        Ok(parse_client_names(&list))
    }

    async fn create_group(&self, stream: &str, group: &str) -> SmithResult<()> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!("Created consumer group '{}' on '{}'", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Err(SmithError::BusyGroup),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(&self, read: GroupRead<'_>) -> SmithResult<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(read.group)
            .arg(read.consumer)
            .arg("COUNT")
            .arg(read.count);

        let start = match read.cursor {
            ReadCursor::Pending => "0",
            ReadCursor::New => {
                if let Some(block) = read.block {
                    cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
                }
                ">"
            }
        };
        cmd.arg("STREAMS").arg(read.stream).arg(start);

        let reply: Option<ReadReply> = cmd.query_async(&mut conn).await?;
        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(|(id, fields)| StreamEntry {
                id,
                fields: fields.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SmithResult<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;
        let reply: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> SmithResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id);
        }
        cmd.arg("JUSTID");

        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn consumers(&self, stream: &str, group: &str) -> SmithResult<Vec<ConsumerInfo>> {
        let mut conn = self.conn().await?;
        let reply: Vec<HashMap<String, Value>> = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        reply
            .iter()
            .map(|info| {
                Ok(ConsumerInfo {
                    name: info_field(info, "name")?,
                    pending: info_field(info, "pending")?,
                    idle: Duration::from_millis(info_field(info, "idle")?),
                })
            })
            .collect()
    }

    async fn enqueue(&self, keys: &QueueKeys, task: &RawTask) -> SmithResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(self
            .scripts
            .enqueue
            .key(&keys.stream)
            .key(&keys.dedup_set)
            .key(keys.queue_names())
            .arg(&task.data)
            .arg(&task.dedup_key)
            .arg(task.retry_count)
            .arg(&keys.qname)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn enqueue_batch(
        &self,
        keys: &QueueKeys,
        tasks: &[RawTask],
    ) -> SmithResult<Vec<Option<String>>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        match self.enqueue_pipeline(&mut conn, keys, tasks).await {
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                debug!("Enqueue script missing on server, reloading");
                self.load_scripts().await?;
                Ok(self.enqueue_pipeline(&mut conn, keys, tasks).await?)
            }
            result => Ok(result?),
        }
    }

    async fn requeue(
        &self,
        keys: &QueueKeys,
        task_id: &str,
        task: &RawTask,
    ) -> SmithResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(self
            .scripts
            .requeue
            .key(&keys.stream)
            .key(&keys.dedup_set)
            .key(keys.queue_names())
            .arg(&keys.group)
            .arg(task_id)
            .arg(&task.data)
            .arg(&task.dedup_key)
            .arg(task.retry_count)
            .arg(&keys.qname)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn dequeue(&self, keys: &QueueKeys, task_id: &str, dedup_key: &str) -> SmithResult<u64> {
        let mut conn = self.conn().await?;
        Ok(self
            .scripts
            .dequeue
            .key(&keys.stream)
            .key(&keys.dedup_set)
            .arg(&keys.group)
            .arg(task_id)
            .arg(dedup_key)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn delete_idle_consumer(&self, keys: &QueueKeys, consumer: &str) -> SmithResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .scripts
            .delete_idle_consumer
            .key(&keys.stream)
            .arg(&keys.group)
            .arg(consumer)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn record(&self, lists: &[ListAppend], counters: &[CounterIncr]) -> SmithResult<()> {
        let mut conn = self.conn().await?;
        // MULTI/EXEC, so concurrent units append to every list in the same order
        let mut pipe = redis::pipe();
        pipe.atomic();
        for append in lists {
            pipe.rpush(&append.key, &append.value)
                .ignore()
                .ltrim(&append.key, -(append.cap as isize), -1)
                .ignore();
        }
        for incr in counters {
            pipe.hincr(&incr.key, incr.field, incr.by).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> SmithResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn counters(&self, key: &str) -> SmithResult<HashMap<String, i64>> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn set_members(&self, key: &str) -> SmithResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn stream_len(&self, stream: &str) -> SmithResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.xlen(stream).await?)
    }

    async fn disconnect(&self) -> SmithResult<()> {
        if self.conn.write().await.take().is_some() {
            debug!("Released Redis connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySpace;
    use crate::outcome::OutcomeKind;

    #[test]
    fn test_parse_client_names() {
        let list = "id=3 addr=127.0.0.1:50188 laddr=127.0.0.1:6379 fd=8 name=q:cg:c:3-abc age=2\n\
                    id=4 addr=127.0.0.1:50190 laddr=127.0.0.1:6379 fd=9 name= age=1\n\
                    id=5 addr=127.0.0.1:50192 laddr=127.0.0.1:6379 fd=10 name=other age=0\n";

        assert_eq!(parse_client_names(list), vec!["q:cg:c:3-abc", "other"]);
    }

    // These tests require a running Redis instance:
    // cargo test --features redis-queue -- --ignored

    #[tokio::test]
    #[ignore] // Ignore by default since it requires Redis
    async fn test_redis_enqueue_dedup_and_dequeue() {
        let connector = RedisConnector::new(RedisConfig::new("redis://localhost:6379")).unwrap();
        let store = connector.open().await.expect("Failed to connect to Redis");
        let keys = KeySpace::new(format!("streamsmith-test-{}", uuid::Uuid::new_v4())).queue("q");

        store.load_scripts().await.unwrap();
        store.create_group(&keys.stream, &keys.group).await.unwrap();
        assert!(matches!(
            store.create_group(&keys.stream, &keys.group).await,
            Err(SmithError::BusyGroup)
        ));

        let task = RawTask {
            data: "\"hello\"".into(),
            dedup_key: "k".into(),
            retry_count: 0,
        };
        let id = store.enqueue(&keys, &task).await.unwrap().unwrap();
        assert!(store.enqueue(&keys, &task).await.unwrap().is_none());

        let batch = store
            .enqueue_batch(&keys, &[task.clone(), task.clone()])
            .await
            .unwrap();
        assert_eq!(batch, vec![None, None]);

        let entries = store
            .read_group(GroupRead {
                stream: &keys.stream,
                group: &keys.group,
                consumer: "c1",
                count: 10,
                cursor: ReadCursor::New,
                block: Some(Duration::from_millis(10)),
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields["retryCount"], "0");

        assert_eq!(store.dequeue(&keys, &id, "k").await.unwrap(), 1);
        assert!(store.set_members(&keys.dedup_set).await.unwrap().is_empty());
        assert!(store.delete_idle_consumer(&keys, "c1").await.unwrap());

        store.disconnect().await.unwrap();
        assert!(matches!(store.client_id().await, Err(SmithError::Disconnected)));
    }

    fn connector() -> RedisConnector {
        RedisConnector::new(RedisConfig::new("redis://localhost:6379")).unwrap()
    }

    fn test_keys() -> QueueKeys {
        KeySpace::new(format!("streamsmith-test-{}", uuid::Uuid::new_v4())).queue("q")
    }

    fn read<'a>(keys: &'a QueueKeys, consumer: &'a str, cursor: ReadCursor) -> GroupRead<'a> {
        GroupRead {
            stream: &keys.stream,
            group: &keys.group,
            consumer,
            count: 10,
            cursor,
            block: None,
        }
    }

    #[tokio::test]
    #[ignore] // Ignore by default since it requires Redis
    async fn test_redis_requeue_round_trip() {
        let store = connector().open().await.expect("Failed to connect to Redis");
        let keys = test_keys();
        store.load_scripts().await.unwrap();
        store.create_group(&keys.stream, &keys.group).await.unwrap();

        let task = RawTask {
            data: "\"retry me\"".into(),
            dedup_key: "k".into(),
            retry_count: 0,
        };
        let id = store.enqueue(&keys, &task).await.unwrap().unwrap();
        assert_eq!(store.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap().len(), 1);

        let retry = RawTask {
            retry_count: 1,
            ..task.clone()
        };
        let new_id = store.requeue(&keys, &id, &retry).await.unwrap().unwrap();
        assert_ne!(new_id, id);
        assert_eq!(store.stream_len(&keys.stream).await.unwrap(), 1);
        assert_eq!(store.set_members(&keys.dedup_set).await.unwrap(), vec!["k"]);
        assert_eq!(store.set_members(&keys.queue_names()).await.unwrap(), vec!["q"]);

        // The chain still holds its key
        assert!(store.enqueue(&keys, &task).await.unwrap().is_none());

        // Replaying the settled attempt changes nothing
        assert_eq!(store.requeue(&keys, &id, &retry).await.unwrap(), None);
        assert_eq!(store.dequeue(&keys, &id, "k").await.unwrap(), 0);
        assert_eq!(store.stream_len(&keys.stream).await.unwrap(), 1);
        assert_eq!(store.set_members(&keys.dedup_set).await.unwrap(), vec!["k"]);

        let entries = store.read_group(read(&keys, "c2", ReadCursor::New)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, new_id);
        assert_eq!(entries[0].fields["retryCount"], "1");
        assert_eq!(entries[0].fields["dedupKey"], "k");

        assert_eq!(store.dequeue(&keys, &new_id, "k").await.unwrap(), 1);
        assert!(store.set_members(&keys.dedup_set).await.unwrap().is_empty());
        store.disconnect().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Ignore by default since it requires Redis
    async fn test_redis_claim_from_closed_connection() {
        let connector = connector();
        let keys = test_keys();
        let gone = connector.open().await.expect("Failed to connect to Redis");
        let live = connector.open().await.expect("Failed to connect to Redis");
        let gone_name = format!("{}:c:gone", keys.group);
        let live_name = format!("{}:c:live", keys.group);

        gone.set_client_name(&gone_name).await.unwrap();
        live.set_client_name(&live_name).await.unwrap();
        live.load_scripts().await.unwrap();
        live.create_group(&keys.stream, &keys.group).await.unwrap();

        let task = RawTask {
            data: "1".into(),
            dedup_key: "k".into(),
            retry_count: 0,
        };
        let id = live.enqueue(&keys, &task).await.unwrap().unwrap();
        let delivered = gone
            .read_group(read(&keys, &gone_name, ReadCursor::New))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);

        gone.disconnect().await.unwrap();
        drop(gone);

        // The server drops the name once the socket is closed
        let mut names = live.client_names().await.unwrap();
        for _ in 0..50 {
            if !names.contains(&gone_name) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            names = live.client_names().await.unwrap();
        }
        assert!(!names.contains(&gone_name));
        assert!(names.contains(&live_name));

        let consumers = live.consumers(&keys.stream, &keys.group).await.unwrap();
        let orphan = consumers.iter().find(|c| c.name == gone_name).unwrap();
        assert_eq!(orphan.pending, 1);

        let pending = live
            .pending(&keys.stream, &keys.group, &gone_name, 1000)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].consumer, gone_name);
        assert_eq!(pending[0].delivery_count, 1);

        let ids: Vec<String> = pending.iter().map(|p| p.id.clone()).collect();
        let claimed = live
            .claim(&keys.stream, &keys.group, &live_name, Duration::ZERO, &ids)
            .await
            .unwrap();
        assert_eq!(claimed, ids);

        let mine = live
            .read_group(read(&keys, &live_name, ReadCursor::Pending))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, id);
        assert_eq!(mine[0].fields["data"], "1");

        assert!(live.delete_idle_consumer(&keys, &gone_name).await.unwrap());
        assert!(!live.delete_idle_consumer(&keys, &live_name).await.unwrap());
        let remaining: Vec<_> = live
            .consumers(&keys.stream, &keys.group)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(remaining, vec![live_name.clone()]);

        // Global and per-queue lists see appends in the same order
        let global = keys.space().outcome_list(OutcomeKind::Success);
        let local = keys.outcome_list(OutcomeKind::Success);
        for value in ["a", "b", "c"] {
            let lists = [
                ListAppend {
                    key: global.clone(),
                    value: value.to_string(),
                    cap: 2,
                },
                ListAppend {
                    key: local.clone(),
                    value: value.to_string(),
                    cap: 10,
                },
            ];
            let counters = [CounterIncr {
                key: keys.stats(),
                field: "processed",
                by: 1,
            }];
            live.record(&lists, &counters).await.unwrap();
        }
        assert_eq!(live.list_range(&global, 0, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(live.list_range(&local, 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(live.counters(&keys.stats()).await.unwrap()["processed"], 3);

        assert_eq!(live.dequeue(&keys, &id, "k").await.unwrap(), 1);
        assert!(live.set_members(&keys.dedup_set).await.unwrap().is_empty());
        live.disconnect().await.unwrap();
    }
}
