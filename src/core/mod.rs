//! Consumer side of the queue.
//!
//! A [`Consumer`] fans out to `concurrency_per_instance` independent
//! [`ConsumerUnit`]s. Each unit owns its own store connection and consumer
//! identity; the only things they share are the queue name, the handler and
//! the configuration.

use crate::config::ConsumerConfig;
use crate::error::{SmithError, SmithResult};
use crate::store::StoreConnector;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::info;

pub mod cleanup;
pub mod handler;
pub mod worker;

pub use cleanup::CleanupReport;
pub use handler::{FnHandler, HandlerResult, TaskHandler, handler_fn};
pub use worker::{ConsumerUnit, ProcessedTask, TaskOutcome, UnitPhase};

/// A pool of consumer units working the same queue.
///
/// # Examples
///
/// ```rust
/// use streamsmith::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> SmithResult<()> {
///     let broker = MemoryBroker::new();
///     let handler = handler_fn(|data, _meta| async move { Ok::<_, BoxError>(data) });
///     let config = ConsumerConfig::with_consumer(ConsumerOptions::default().with_concurrency(2));
///
///     let consumer = Consumer::new("emails", Arc::new(handler), config, &broker).await?;
///     consumer.start();
///     consumer.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Consumer {
    qname: String,
    units: Vec<ConsumerUnit>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("qname", &self.qname)
            .field("units", &self.units.len())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Register `concurrency_per_instance` units on `qname`, each on its own
    /// connection from `connector`. Units start paused.
    pub async fn new(
        qname: &str,
        handler: Arc<dyn TaskHandler>,
        config: ConsumerConfig,
        connector: &dyn StoreConnector,
    ) -> SmithResult<Self> {
        if config.consumer.concurrency_per_instance < 1 {
            return Err(SmithError::config(
                "concurrency_per_instance must be at least 1",
            ));
        }
        config
            .validate()
            .map_err(|errors| SmithError::config(errors.join("; ")))?;

        let config = Arc::new(config);
        let units = try_join_all((0..config.consumer.concurrency_per_instance).map(|_| {
            ConsumerUnit::new(qname, Arc::clone(&handler), Arc::clone(&config), connector)
        }))
        .await?;

        info!("🔧 Consumer pool for {} ready with {} units", qname, units.len());

        Ok(Self {
            qname: qname.to_string(),
            units,
        })
    }

    /// Queue name.
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// The units, in creation order.
    pub fn units(&self) -> &[ConsumerUnit] {
        &self.units
    }

    /// Consumer identities of every unit.
    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name().to_string()).collect()
    }

    /// Start every unit's loop.
    pub fn start(&self) {
        for unit in &self.units {
            unit.start();
        }
    }

    /// Ask every unit to stop after its current task.
    pub fn pause(&self) {
        for unit in &self.units {
            unit.pause();
        }
    }

    /// Restart paused units.
    pub fn resume(&self) {
        for unit in &self.units {
            unit.resume();
        }
    }

    /// Pause and release every unit's connection.
    ///
    /// Every unit is disconnected even if an earlier one fails; the first
    /// error is returned.
    pub async fn disconnect(&self) -> SmithResult<()> {
        let results = futures::future::join_all(self.units.iter().map(|u| u.disconnect())).await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerOptions, QueueOptions};
    use crate::error::BoxError;
    use crate::inspect::{QueueInspector, Scope};
    use crate::producer::Producer;
    use crate::store::MemoryBroker;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::sleep;

    fn echo() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|data, _| async move { Ok::<_, BoxError>(data) }))
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let broker = MemoryBroker::new();
        let options = ConsumerOptions {
            concurrency_per_instance: 0,
            ..Default::default()
        };

        let result = Consumer::new("q", echo(), ConsumerConfig::with_consumer(options), &broker).await;
        assert!(matches!(result, Err(SmithError::InvalidConfig { .. })));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_units_have_distinct_identities() {
        let broker = MemoryBroker::new();
        let config = ConsumerConfig::with_consumer(ConsumerOptions::default().with_concurrency(3));
        let consumer = Consumer::new("q", echo(), config, &broker).await.unwrap();

        let names: HashSet<_> = consumer.names().into_iter().collect();
        assert_eq!(names.len(), 3);
        assert_eq!(consumer.units().len(), 3);
        assert!(consumer.units().iter().all(|u| u.is_paused()));
        assert_eq!(broker.connection_count(), 3);

        consumer.disconnect().await.unwrap();
        assert_eq!(broker.connection_count(), 0);
        assert!(
            consumer
                .units()
                .iter()
                .all(|u| u.phase() == UnitPhase::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_processes_every_task_once() {
        let broker = MemoryBroker::new();
        let producer = Producer::new("q", &broker, &QueueOptions::default())
            .await
            .unwrap();
        for i in 0..20 {
            producer.add_task(&i, None).await.unwrap();
        }

        let config = ConsumerConfig::with_consumer(
            ConsumerOptions::default()
                .with_concurrency(3)
                .with_task_buffer_size(2)
                .with_block_timeout_ms(20),
        );
        let consumer = Consumer::new("q", echo(), config, &broker).await.unwrap();
        consumer.start();

        let inspector = QueueInspector::new(&broker, &QueueOptions::default())
            .await
            .unwrap();
        for _ in 0..500 {
            if inspector.results(Scope::Global).await.unwrap().len() >= 20 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        consumer.pause();

        let mut data: Vec<i64> = inspector
            .results(Scope::queue("q"))
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.data.as_i64())
            .collect();
        data.sort_unstable();
        assert_eq!(data, (0..20).collect::<Vec<_>>());
        assert_eq!(inspector.stats(Scope::Global).await.unwrap().processed, 20);
        assert_eq!(inspector.pending_len("q").await.unwrap(), 0);
        assert!(inspector.failed(Scope::Global).await.unwrap().is_empty());

        consumer.disconnect().await.unwrap();
    }
}
