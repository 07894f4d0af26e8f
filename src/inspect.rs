//! Read-only view of queue bookkeeping.
//!
//! Outcome lists are returned oldest first.

use crate::config::QueueOptions;
use crate::error::{SmithError, SmithResult};
use crate::keys::KeySpace;
use crate::outcome::{OutcomeKind, OutcomeRecord};
use crate::store::{SharedStore, StoreConnector};
use serde::{Deserialize, Serialize};

/// Whether to look at the namespace-wide or a single queue's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every queue in the namespace
    Global,
    /// One queue
    Queue(String),
}

impl Scope {
    /// Scope of a single queue.
    pub fn queue(qname: impl Into<String>) -> Self {
        Self::Queue(qname.into())
    }
}

/// Counters maintained by consumer units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks handed to a handler
    pub processed: u64,
    /// Failed attempts that were requeued
    pub retries: u64,
    /// Failed attempts
    pub failed: u64,
    /// Tasks dead-lettered
    pub dead: u64,
}

/// Reads stats, outcome lists and queue state.
pub struct QueueInspector {
    store: SharedStore,
    space: KeySpace,
}

impl std::fmt::Debug for QueueInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueInspector")
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

impl QueueInspector {
    /// Open a dedicated connection.
    pub async fn new(connector: &dyn StoreConnector, options: &QueueOptions) -> SmithResult<Self> {
        Ok(Self::with_store(connector.connect().await?, options))
    }

    /// Use an existing connection.
    pub fn with_store(store: SharedStore, options: &QueueOptions) -> Self {
        Self {
            store,
            space: KeySpace::new(&options.namespace),
        }
    }

    /// Every queue name tasks were ever submitted to.
    pub async fn queue_names(&self) -> SmithResult<Vec<String>> {
        self.store.set_members(&self.space.queue_names()).await
    }

    /// Counters for `scope`. Missing counters read as zero.
    pub async fn stats(&self, scope: Scope) -> SmithResult<QueueStats> {
        let key = match &scope {
            Scope::Global => self.space.stats(),
            Scope::Queue(qname) => self.space.queue(qname).stats(),
        };
        let counters = self.store.counters(&key).await?;
        let read = |field: &str| counters.get(field).copied().unwrap_or(0).max(0) as u64;

        Ok(QueueStats {
            processed: read("processed"),
            retries: read("retries"),
            failed: read("failed"),
            dead: read("dead"),
        })
    }

    /// Success records.
    pub async fn results(&self, scope: Scope) -> SmithResult<Vec<OutcomeRecord>> {
        self.records(OutcomeKind::Success, scope).await
    }

    /// Failure records, one per failed attempt.
    pub async fn failed(&self, scope: Scope) -> SmithResult<Vec<OutcomeRecord>> {
        self.records(OutcomeKind::Failure, scope).await
    }

    /// Dead-letter records.
    pub async fn dead(&self, scope: Scope) -> SmithResult<Vec<OutcomeRecord>> {
        self.records(OutcomeKind::Dead, scope).await
    }

    /// Number of entries still in the queue's stream.
    pub async fn pending_len(&self, qname: &str) -> SmithResult<u64> {
        self.store.stream_len(&self.space.queue(qname).stream).await
    }

    /// Dedup keys currently in flight.
    pub async fn dedup_keys(&self, qname: &str) -> SmithResult<Vec<String>> {
        self.store
            .set_members(&self.space.queue(qname).dedup_set)
            .await
    }

    /// Release the connection.
    pub async fn disconnect(&self) -> SmithResult<()> {
        self.store.disconnect().await
    }

    async fn records(&self, kind: OutcomeKind, scope: Scope) -> SmithResult<Vec<OutcomeRecord>> {
        let key = match &scope {
            Scope::Global => self.space.outcome_list(kind),
            Scope::Queue(qname) => self.space.queue(qname).outcome_list(kind),
        };

        self.store
            .list_range(&key, 0, -1)
            .await?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(SmithError::from))
            .collect()
    }
}
