//! Configuration types for Streamsmith.
//!
//! Every structure here is built once, validated, and then shared read-only
//! between the producer and consumer units that were constructed from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration for a [`Consumer`](crate::core::Consumer) and its units.
///
/// # Examples
///
/// ```rust
/// use streamsmith::config::{ConsumerConfig, ConsumerOptions};
///
/// // Use default configuration
/// let config = ConsumerConfig::default();
///
/// // Custom configuration
/// let config = ConsumerConfig {
///     consumer: ConsumerOptions {
///         max_retry: 3,
///         concurrency_per_instance: 4,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer unit behaviour
    pub consumer: ConsumerOptions,

    /// Key namespace and outcome list capacities
    pub queue: QueueOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Consumer unit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Maximum time a handler may run before the attempt counts as failed (in milliseconds)
    pub worker_fn_timeout_ms: u64,

    /// Number of entries fetched per poll
    pub task_buffer_size: usize,

    /// How many times a failed task is requeued before it is dead-lettered
    pub max_retry: u32,

    /// Number of independent units a `Consumer` runs
    pub concurrency_per_instance: usize,

    /// Upper bound of a single blocking read (in milliseconds)
    pub block_timeout_ms: u64,

    /// Minimum idle age of an orphan's pending entry before it is claimed (in milliseconds).
    /// Defaults to twice the handler timeout.
    pub claim_min_idle_ms: Option<u64>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            worker_fn_timeout_ms: 24 * 60 * 60 * 1000, // 24 hours
            task_buffer_size: 10,
            max_retry: 0,
            concurrency_per_instance: 1,
            block_timeout_ms: 1000,
            claim_min_idle_ms: None,
        }
    }
}

impl ConsumerOptions {
    /// Largest accepted `block_timeout_ms` (one hour).
    pub const MAX_BLOCK_TIMEOUT_MS: u64 = 60 * 60 * 1000;

    /// Set the handler timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.worker_fn_timeout_ms = timeout_ms;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the number of units per consumer.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency_per_instance = concurrency;
        self
    }

    /// Set the number of entries fetched per poll.
    pub fn with_task_buffer_size(mut self, size: usize) -> Self {
        self.task_buffer_size = size;
        self
    }

    /// Set the blocking read bound.
    pub fn with_block_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.block_timeout_ms = timeout_ms;
        self
    }

    /// Handler timeout as a `Duration`.
    pub fn worker_fn_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_fn_timeout_ms)
    }

    /// Blocking read bound as a `Duration`.
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Idle age past which an empty, disconnected consumer identity is deleted.
    pub fn idle_consumer_threshold(&self) -> Duration {
        Duration::from_millis(self.worker_fn_timeout_ms.saturating_mul(5))
    }

    /// Minimum idle age of an orphan's pending entry before it may be claimed.
    pub fn claim_min_idle(&self) -> Duration {
        Duration::from_millis(
            self.claim_min_idle_ms
                .unwrap_or_else(|| self.worker_fn_timeout_ms.saturating_mul(2)),
        )
    }
}

/// Key namespace and bookkeeping capacities shared by producers and consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Prefix applied to every store key
    pub namespace: String,

    /// Capacity of the global result list
    pub max_result_list_size: usize,

    /// Capacity of the global failed list
    pub max_failed_list_size: usize,

    /// Capacity of the global dead list
    pub max_dead_list_size: usize,

    /// Capacity of each per-queue result/failed/dead list
    pub max_individual_queue_result_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            namespace: "streamsmith".to_string(),
            max_result_list_size: 100_000,
            max_failed_list_size: 100_000,
            max_dead_list_size: 100_000,
            max_individual_queue_result_size: 10_000,
        }
    }
}

impl QueueOptions {
    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the same capacity for all three global lists.
    pub fn with_global_list_size(mut self, size: usize) -> Self {
        self.max_result_list_size = size;
        self.max_failed_list_size = size;
        self.max_dead_list_size = size;
        self
    }

    /// Set the per-queue list capacity.
    pub fn with_queue_list_size(mut self, size: usize) -> Self {
        self.max_individual_queue_result_size = size;
        self
    }

    fn validate_into(&self, errors: &mut Vec<String>) {
        if self.namespace.is_empty() {
            errors.push("Key namespace must not be empty".to_string());
        }

        let caps = [
            ("result", self.max_result_list_size),
            ("failed", self.max_failed_list_size),
            ("dead", self.max_dead_list_size),
            ("per-queue", self.max_individual_queue_result_size),
        ];
        for (list, cap) in caps {
            if cap == 0 {
                errors.push(format!("Capacity of the {list} list must be greater than 0"));
            }
        }
    }

    /// Validate the options and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Redis connection configuration.
#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Time allowed to establish a connection (in milliseconds)
    pub connection_timeout_ms: u64,

    /// Time allowed for a single reply; must exceed the consumer block timeout (in milliseconds)
    pub response_timeout_ms: u64,
}

#[cfg(feature = "redis-queue")]
impl RedisConfig {
    /// Create a configuration for the given connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            connection_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
        }
    }
}

/// Callback receiving `(prefix, message)` for every consumer step message.
#[derive(Clone)]
pub struct LogSink(pub Arc<dyn Fn(&str, &str) + Send + Sync>);

impl LogSink {
    /// Wrap a closure as a sink.
    pub fn new(f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink(..)")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit per-step consumer messages
    pub enabled: bool,

    /// Log level filter used by [`init_tracing`](crate::logging::init_tracing)
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Include target module in logs
    pub include_targets: bool,

    /// Receives step messages instead of `tracing` when set
    #[serde(skip)]
    pub sink: Option<LogSink>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            json_format: false,
            include_targets: false,
            sink: None,
        }
    }
}

impl LoggingConfig {
    /// Enable step messages, delivered to `sink`.
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.enabled = true;
        self.sink = Some(sink);
        self
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl ConsumerConfig {
    /// Create a configuration with the given consumer options.
    pub fn with_consumer(consumer: ConsumerOptions) -> Self {
        Self {
            consumer,
            ..Default::default()
        }
    }

    /// Set the queue options.
    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    /// Set the logging configuration.
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            consumer: ConsumerOptions {
                worker_fn_timeout_ms: 60_000,
                max_retry: 1,
                ..Default::default()
            },
            queue: QueueOptions {
                max_result_list_size: 1_000,
                max_failed_list_size: 1_000,
                max_dead_list_size: 1_000,
                max_individual_queue_result_size: 100,
                ..Default::default()
            },
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            consumer: ConsumerOptions {
                worker_fn_timeout_ms: 1_000,
                task_buffer_size: 10,
                block_timeout_ms: 50,
                ..Default::default()
            },
            queue: QueueOptions::default(),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.consumer.concurrency_per_instance < 1 {
            errors.push("Concurrency cannot be less than 1".to_string());
        }

        if self.consumer.task_buffer_size == 0 {
            errors.push("Task buffer size must be greater than 0".to_string());
        }

        if self.consumer.worker_fn_timeout_ms == 0 {
            errors.push("Worker function timeout must be greater than 0".to_string());
        }

        if self.consumer.block_timeout_ms == 0 {
            errors.push("Block timeout must be greater than 0".to_string());
        } else if self.consumer.block_timeout_ms > ConsumerOptions::MAX_BLOCK_TIMEOUT_MS {
            errors.push(format!(
                "Block timeout cannot exceed {} ms",
                ConsumerOptions::MAX_BLOCK_TIMEOUT_MS
            ));
        }

        self.queue.validate_into(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
