//! # Streamsmith
//!
//! A durable, at-least-once task queue on top of consumer-grouped streams.
//!
//! ## Features
//!
//! - **Deduplication**: a task submitted with a dedup key is rejected while an
//!   earlier task with the same key is still in flight
//! - **Failover**: a live consumer claims the pending work of consumers whose
//!   connection is gone, and eventually deletes their identity
//! - **Retries and dead-lettering**: failed or timed-out tasks are requeued up
//!   to `max_retry` times, then moved to the dead list
//! - **Bookkeeping**: capped result/failed/dead lists and counters, global and
//!   per queue, readable with [`QueueInspector`](inspect::QueueInspector)
//! - **Backends**: an in-process [`MemoryBroker`](store::MemoryBroker) and
//!   Redis Streams behind the `redis-queue` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use streamsmith::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> SmithResult<()> {
//!     let broker = MemoryBroker::new();
//!
//!     let producer = Producer::new("emails", &broker, &QueueOptions::default()).await?;
//!     producer
//!         .add_task(&json!({ "to": "someone@example.com" }), Some("welcome-42"))
//!         .await?;
//!
//!     let handler = handler_fn(|data, _meta| async move {
//!         Ok::<_, BoxError>(json!({ "sent": data["to"] }))
//!     });
//!     let consumer = Consumer::new(
//!         "emails",
//!         Arc::new(handler),
//!         ConsumerConfig::default(),
//!         &broker,
//!     )
//!     .await?;
//!
//!     let unit = &consumer.units()[0];
//!     unit.wait_for_task().await?;
//!     unit.fetch_pending().await?;
//!     unit.process_next().await?;
//!
//!     consumer.disconnect().await?;
//!     producer.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod inspect;
pub mod keys;
pub mod logging;
pub mod outcome;
pub mod producer;
pub mod store;
pub mod task;
pub mod utils;

pub mod prelude {
    pub use crate::config::{
        ConsumerConfig, ConsumerOptions, LogLevel, LogSink, LoggingConfig, QueueOptions,
    };
    pub use crate::core::{
        Consumer, ConsumerUnit, HandlerResult, ProcessedTask, TaskHandler, TaskOutcome,
        UnitPhase, handler_fn,
    };
    pub use crate::error::{BoxError, SmithError, SmithResult};
    pub use crate::inspect::{QueueInspector, QueueStats, Scope};
    pub use crate::logging::init_tracing;
    pub use crate::outcome::{OutcomeKind, OutcomeRecord};
    pub use crate::producer::Producer;
    pub use crate::store::{MemoryBroker, StoreConnector, StreamStore};
    pub use crate::task::{NewTask, TaskId, TaskMetadata};
    pub use async_trait::async_trait;

    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub use crate::config::RedisConfig;
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub use crate::store::{RedisConnector, RedisStore};
}

pub use crate::config::{ConsumerConfig, ConsumerOptions, LoggingConfig, QueueOptions};
pub use crate::core::{Consumer, ConsumerUnit, TaskHandler, handler_fn};
pub use crate::error::{SmithError, SmithResult};
pub use crate::inspect::QueueInspector;
pub use crate::producer::Producer;
pub use crate::store::MemoryBroker;
pub use async_trait::async_trait;
