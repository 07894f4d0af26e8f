//! Task handlers and their timeout-bounded invocation.

use crate::error::{BoxError, SmithError, SmithResult};
use crate::task::TaskMetadata;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// What a handler returns: a JSON result, or any error.
pub type HandlerResult = Result<Value, BoxError>;

/// User code run for every delivered task.
///
/// Returning an error, panicking or exceeding the configured timeout all count
/// as a failed attempt.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Process one task.
    async fn handle(&self, data: Value, metadata: TaskMetadata) -> HandlerResult;
}

/// A [`TaskHandler`] backed by an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnHandler(..)")
    }
}

/// Wrap an async closure as a handler.
///
/// ```rust
/// use streamsmith::core::handler_fn;
/// use streamsmith::error::BoxError;
/// use serde_json::json;
///
/// let handler = handler_fn(|data, meta| async move {
///     Ok::<_, BoxError>(json!({ "echo": data, "attempt": meta.retry_count }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, TaskMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, TaskMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, data: Value, metadata: TaskMetadata) -> HandlerResult {
        (self.f)(data, metadata).await
    }
}

/// Run `handler` on its own task and race it against `budget`.
///
/// On timeout the spawned task is left running; whatever it produces later is
/// discarded.
pub(crate) async fn invoke(
    handler: Arc<dyn TaskHandler>,
    data: Value,
    metadata: TaskMetadata,
    budget: Duration,
) -> SmithResult<Value> {
    let handle = tokio::spawn(async move { handler.handle(data, metadata).await });

    match timeout(budget, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(SmithError::handler(error)),
        Ok(Err(join_error)) => Err(SmithError::HandlerPanicked {
            message: join_error.to_string(),
        }),
        Err(_) => Err(SmithError::Timeout {
            timeout_ms: budget.as_millis() as u64,
        }),
    }
}
