//! Task submission.
//!
//! # Examples
//!
//! ```rust,no_run
//! use streamsmith::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> SmithResult<()> {
//! let broker = MemoryBroker::new();
//! let producer = Producer::new("emails", &broker, &QueueOptions::default()).await?;
//!
//! let id = producer.add_task(&json!({"to": "a@example.com"}), Some("welcome-a")).await?;
//! assert!(id.is_some());
//!
//! // Same dedup key while the first task is in flight: rejected
//! let dup = producer.add_task(&json!({"to": "a@example.com"}), Some("welcome-a")).await?;
//! assert!(dup.is_none());
//! # Ok(())
//! # }
//! ```

use crate::config::QueueOptions;
use crate::error::{SmithError, SmithResult};
use crate::keys::{KeySpace, QueueKeys};
use crate::store::{SharedStore, StoreConnector};
use crate::task::{NewTask, RawTask, TaskId};
use serde::Serialize;
use tracing::{debug, info};

/// Appends tasks to one queue.
pub struct Producer {
    store: SharedStore,
    keys: QueueKeys,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Open a dedicated connection and register the queue scripts.
    pub async fn new(
        qname: &str,
        connector: &dyn StoreConnector,
        options: &QueueOptions,
    ) -> SmithResult<Self> {
        Self::with_store(qname, connector.connect().await?, options).await
    }

    /// Use an existing connection.
    pub async fn with_store(
        qname: &str,
        store: SharedStore,
        options: &QueueOptions,
    ) -> SmithResult<Self> {
        options.validate().map_err(|errors| SmithError::config(errors.join("; ")))?;

        store.load_scripts().await?;
        let keys = KeySpace::new(&options.namespace).queue(qname);
        debug!("Producer ready for queue '{}'", keys.qname);

        Ok(Self { store, keys })
    }

    /// Keys of the queue this producer writes to.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Submit one task.
    ///
    /// Returns the new entry id, or `None` if `dedup_key` belongs to a task
    /// that is still in flight. An empty key counts as no key.
    pub async fn add_task<T: Serialize + ?Sized>(
        &self,
        data: &T,
        dedup_key: Option<&str>,
    ) -> SmithResult<Option<TaskId>> {
        let raw = Self::raw_task(data, dedup_key)?;
        let id = self.store.enqueue(&self.keys, &raw).await?;

        if id.is_none() {
            debug!(
                "Task with dedup key '{}' already in flight on '{}'",
                raw.dedup_key, self.keys.qname
            );
        }
        Ok(id)
    }

    /// Submit many tasks, one pipelined round trip per `chunk_size` tasks.
    ///
    /// Each task is still dedup-checked on its own. Duplicates are dropped from
    /// the returned ids, which keep submission order.
    pub async fn bulk_add_tasks<T: Serialize>(
        &self,
        tasks: &[NewTask<T>],
        chunk_size: usize,
    ) -> SmithResult<Vec<TaskId>> {
        if chunk_size == 0 {
            return Err(SmithError::config("Chunk size must be greater than 0"));
        }

        let raw = tasks
            .iter()
            .map(|t| Self::raw_task(&t.data, t.dedup_key.as_deref()))
            .collect::<SmithResult<Vec<_>>>()?;

        let mut ids = Vec::with_capacity(raw.len());
        for chunk in raw.chunks(chunk_size) {
            let results = self.store.enqueue_batch(&self.keys, chunk).await?;
            ids.extend(results.into_iter().flatten());
        }

        info!(
            "Added {} of {} tasks to '{}'",
            ids.len(),
            tasks.len(),
            self.keys.qname
        );
        Ok(ids)
    }

    /// Release the connection. Safe to call more than once.
    pub async fn disconnect(&self) -> SmithResult<()> {
        self.store.disconnect().await
    }

    fn raw_task<T: Serialize + ?Sized>(data: &T, dedup_key: Option<&str>) -> SmithResult<RawTask> {
        Ok(RawTask {
            data: serde_json::to_string(data)?,
            dedup_key: dedup_key.unwrap_or_default().to_string(),
            retry_count: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBroker, StreamStore};
    use serde_json::json;
    use tokio_test::assert_ok;

    async fn producer(broker: &MemoryBroker) -> Producer {
        Producer::new("test-queue", broker, &QueueOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_task_dedup() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker).await;

        let first = producer.add_task(&json!({"n": 1}), Some("k")).await.unwrap();
        let second = producer.add_task(&json!({"n": 2}), Some("k")).await.unwrap();
        let keyless = producer.add_task(&json!({"n": 3}), Some("")).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(keyless.is_some());

        let store = broker.open();
        assert_eq!(store.stream_len(&producer.keys().stream).await.unwrap(), 2);
        assert_eq!(
            store.set_members(&producer.keys().queue_names()).await.unwrap(),
            vec!["test-queue"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_dedup_yields_one_id() {
        let broker = MemoryBroker::new();
        let a = producer(&broker).await;
        let b = producer(&broker).await;

        let (x, y) = tokio::join!(
            a.add_task("payload", Some("same")),
            b.add_task("payload", Some("same"))
        );
        let ids: Vec<_> = [x.unwrap(), y.unwrap()].into_iter().flatten().collect();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_add_single_dedup_key() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker).await;

        let tasks: Vec<_> = (0..1000)
            .map(|i| NewTask::new(json!({"i": i})).with_dedup_key("only-one"))
            .collect();
        let ids = producer.bulk_add_tasks(&tasks, 100).await.unwrap();

        assert_eq!(ids.len(), 1);
        let store = broker.open();
        assert_eq!(store.stream_len(&producer.keys().stream).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bulk_add_keeps_submission_order() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker).await;

        let tasks = vec![
            NewTask::new(1).with_dedup_key("a"),
            NewTask::new(2).with_dedup_key("a"),
            NewTask::new(3),
            NewTask::new(4).with_dedup_key("b"),
        ];
        let ids = producer.bulk_add_tasks(&tasks, 3).await.unwrap();
        assert_eq!(ids.len(), 3);

        let mut sorted = ids.clone();
        sorted.sort_by_key(|id| {
            let (ms, seq) = id.split_once('-').unwrap();
            (ms.parse::<u64>().unwrap(), seq.parse::<u64>().unwrap())
        });
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_bulk_add_rejects_zero_chunk() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker).await;

        let err = producer
            .bulk_add_tasks(&[NewTask::new(1)], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SmithError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker).await;

        assert_ok!(producer.disconnect().await);
        assert_ok!(producer.disconnect().await);
        assert!(matches!(
            producer.add_task(&1, None).await,
            Err(SmithError::Disconnected)
        ));
        assert_eq!(broker.connection_count(), 0);
    }
}
