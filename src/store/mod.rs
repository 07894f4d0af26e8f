//! Storage backends for Streamsmith.
//!
//! Queues live in a store that offers consumer-grouped streams, sets, capped
//! lists and counter maps:
//! - **Memory**: in-process broker, for tests and single-process applications
//! - **Redis**: Redis Streams, for multi-process and multi-server deployments
//!
//! The four operations that combine a check with a mutation (`enqueue`,
//! `requeue`, `dequeue`, `delete_idle_consumer`) are atomic in every backend.
//!
//! # Examples
//!
//! ```rust,no_run
//! use streamsmith::prelude::*;
//!
//! # async fn run() -> SmithResult<()> {
//! // In-memory broker
//! let broker = MemoryBroker::new();
//! let conn = broker.connect().await?;
//!
//! // Redis (requires redis-queue feature)
//! # #[cfg(feature = "redis-queue")]
//! let redis = RedisConnector::new(RedisConfig::new("redis://localhost:6379"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::SmithResult;
use crate::keys::QueueKeys;
use crate::task::RawTask;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::{MemoryBroker, MemoryStore};

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::{RedisConnector, RedisStore};

/// An entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id
    pub id: String,
    /// Field map; empty if the entry was deleted while still pending
    pub fields: HashMap<String, String>,
}

/// An entry delivered to a consumer but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id
    pub id: String,
    /// Current owner
    pub consumer: String,
    /// Time since the last delivery
    pub idle: Duration,
    /// Number of deliveries
    pub delivery_count: u64,
}

/// A consumer identity registered in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Consumer name
    pub name: String,
    /// Number of pending entries
    pub pending: u64,
    /// Time since the consumer last interacted with the group
    pub idle: Duration,
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries already delivered to this consumer and not acknowledged
    Pending,
    /// Entries never delivered to any consumer of the group
    New,
}

/// Parameters of a consumer-group read.
#[derive(Debug, Clone)]
pub struct GroupRead<'a> {
    /// Stream key
    pub stream: &'a str,
    /// Group name
    pub group: &'a str,
    /// Reading consumer
    pub consumer: &'a str,
    /// Maximum number of entries
    pub count: usize,
    /// Start position
    pub cursor: ReadCursor,
    /// Block up to this long when nothing is available; only used with [`ReadCursor::New`]
    pub block: Option<Duration>,
}

/// Append `value` to list `key`, keeping only the newest `cap` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAppend {
    /// List key
    pub key: String,
    /// Serialized element
    pub value: String,
    /// Capacity
    pub cap: usize,
}

/// Increment `field` of hash `key` by `by`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterIncr {
    /// Hash key
    pub key: String,
    /// Field name
    pub field: &'static str,
    /// Increment
    pub by: i64,
}

/// Opens dedicated store connections.
///
/// Every consumer unit owns one connection, since its identity is bound to it.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> SmithResult<Arc<dyn StreamStore>>;
}

/// One connection to a store.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Register the atomic scripts with the server.
    async fn load_scripts(&self) -> SmithResult<()>;

    /// Server-assigned id of this connection.
    async fn client_id(&self) -> SmithResult<u64>;

    /// Announce a name for this connection.
    async fn set_client_name(&self, name: &str) -> SmithResult<()>;

    /// Names announced by every live connection.
    async fn client_names(&self) -> SmithResult<Vec<String>>;

    /// Create the group (and the stream) reading from the start.
    ///
    /// Fails with [`SmithError::BusyGroup`](crate::error::SmithError::BusyGroup)
    /// if the group already exists.
    async fn create_group(&self, stream: &str, group: &str) -> SmithResult<()>;

    /// Read entries as a group consumer.
    async fn read_group(&self, read: GroupRead<'_>) -> SmithResult<Vec<StreamEntry>>;

    /// Pending entries owned by `consumer`, oldest first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SmithResult<Vec<PendingEntry>>;

    /// Transfer ownership of `ids` idle for at least `min_idle` to `consumer`.
    /// Returns the ids actually claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> SmithResult<Vec<String>>;

    /// Consumer identities registered in the group.
    async fn consumers(&self, stream: &str, group: &str) -> SmithResult<Vec<ConsumerInfo>>;

    /// Dedup-checked insert. Returns `None` when the dedup key is in flight.
    async fn enqueue(&self, keys: &QueueKeys, task: &RawTask) -> SmithResult<Option<String>>;

    /// Pipelined [`enqueue`](Self::enqueue); each insert stays atomic on its own.
    async fn enqueue_batch(
        &self,
        keys: &QueueKeys,
        tasks: &[RawTask],
    ) -> SmithResult<Vec<Option<String>>>;

    /// Acknowledge `task_id`, insert the retried task and remove `task_id` in
    /// one step.
    ///
    /// Returns `None` without inserting anything when `task_id` was no longer
    /// pending in the group, i.e. another consumer already settled it.
    async fn requeue(
        &self,
        keys: &QueueKeys,
        task_id: &str,
        task: &RawTask,
    ) -> SmithResult<Option<String>>;

    /// Acknowledge and remove `task_id` in one step, releasing the dedup key
    /// only if the entry was still pending. Returns the number of removed
    /// entries.
    async fn dequeue(&self, keys: &QueueKeys, task_id: &str, dedup_key: &str) -> SmithResult<u64>;

    /// Delete `consumer` from the group if it still has no pending entries.
    async fn delete_idle_consumer(&self, keys: &QueueKeys, consumer: &str) -> SmithResult<bool>;

    /// Append to capped lists and bump counters in one round trip.
    async fn record(&self, lists: &[ListAppend], counters: &[CounterIncr]) -> SmithResult<()>;

    /// Elements `start..=stop` of a list; negative indexes count from the end.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> SmithResult<Vec<String>>;

    /// All fields of a counter map.
    async fn counters(&self, key: &str) -> SmithResult<HashMap<String, i64>>;

    /// Members of a set.
    async fn set_members(&self, key: &str) -> SmithResult<Vec<String>>;

    /// Number of entries in a stream.
    async fn stream_len(&self, stream: &str) -> SmithResult<u64>;

    /// Release the connection. Idempotent; later operations fail with
    /// [`SmithError::Disconnected`](crate::error::SmithError::Disconnected).
    async fn disconnect(&self) -> SmithResult<()>;
}

/// Convenient type alias for a shared connection
pub type SharedStore = Arc<dyn StreamStore>;
