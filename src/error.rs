//! Error types for Streamsmith operations.

use thiserror::Error;

/// Result type used throughout Streamsmith.
pub type SmithResult<T> = Result<T, SmithError>;

/// Boxed error returned by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for Streamsmith operations.
#[derive(Error, Debug)]
pub enum SmithError {
    /// A task record read from the stream is malformed
    #[error("Invalid task record: {message}")]
    Validation {
        /// What was wrong with the record
        message: String,
    },

    /// Consumer or producer configuration is invalid
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// The handler exceeded its time budget
    #[error("Task timed out after {timeout_ms}ms")]
    Timeout {
        /// The configured budget in milliseconds
        timeout_ms: u64,
    },

    /// The handler returned an error
    #[error("Task handler failed: {message}")]
    Handler {
        /// Error message
        message: String,
        /// Underlying handler error
        #[source]
        source: Option<BoxError>,
    },

    /// The handler panicked
    #[error("Task handler panicked: {message}")]
    HandlerPanicked {
        /// Panic description
        message: String,
    },

    /// The consumer group already exists
    #[error("Consumer group already exists")]
    BusyGroup,

    /// Store backend error
    #[error("Store error: {message}")]
    Store {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The store connection has been released
    #[error("Store connection is closed")]
    Disconnected,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis connection error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl SmithError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wrap an error returned by a task handler
    pub fn handler(source: BoxError) -> Self {
        Self::Handler {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without an underlying cause
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Classification name recorded in failure records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::InvalidConfig { .. } => "InvalidConfigError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Handler { .. } => "HandlerError",
            Self::HandlerPanicked { .. } => "HandlerPanic",
            Self::BusyGroup => "BusyGroupError",
            Self::Store { .. } | Self::Disconnected => "StoreError",
            Self::Serialization(_) => "SerializationError",
            #[cfg(feature = "redis-queue")]
            Self::Redis(_) => "RedisError",
        }
    }

    /// Whether this error came out of a handler invocation rather than the queue itself.
    pub fn is_task_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Handler { .. } | Self::HandlerPanicked { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names() {
        assert_eq!(SmithError::Timeout { timeout_ms: 10 }.name(), "TimeoutError");
        assert_eq!(SmithError::validation("bad").name(), "ValidationError");
        assert_eq!(SmithError::config("bad").name(), "InvalidConfigError");
        assert_eq!(SmithError::Disconnected.name(), "StoreError");
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let source: BoxError = "boom".into();
        let err = SmithError::handler(source);

        assert!(err.is_task_failure());
        assert_eq!(err.to_string(), "Task handler failed: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
