//! Task definition and validation.

use crate::error::{SmithError, SmithResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stream entry identifier assigned by the store
pub type TaskId = String;

/// Field names of a task record in the stream.
pub(crate) mod fields {
    pub const DATA: &str = "data";
    pub const DEDUP_KEY: &str = "dedupKey";
    pub const RETRY_COUNT: &str = "retryCount";
}

/// The fields stored with every stream entry.
///
/// Deserialization accepts `retryCount` either as a number or as a numeric
/// string, since stream fields are always strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTask {
    /// Serialized payload
    pub data: String,
    /// Dedup key, empty when absent
    pub dedup_key: String,
    /// Number of prior failed attempts
    #[serde(deserialize_with = "retry_count_from_any")]
    pub retry_count: u32,
}

fn retry_count_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u32),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(|_| {
            serde::de::Error::custom(format!(
                "retryCount must be a non-negative integer, got {s:?}"
            ))
        }),
    }
}

impl RawTask {
    /// Validate the raw field map read from a stream entry.
    pub fn from_fields(entry: &HashMap<String, String>) -> SmithResult<Self> {
        let value = serde_json::to_value(entry)?;
        serde_json::from_value(value)
            .map_err(|e| SmithError::validation(format!("Invalid rawData for task: {e}")))
    }

    /// Field/value pairs as written to the stream.
    pub fn to_fields(&self) -> [(&'static str, String); 3] {
        [
            (fields::DATA, self.data.clone()),
            (fields::DEDUP_KEY, self.dedup_key.clone()),
            (fields::RETRY_COUNT, self.retry_count.to_string()),
        ]
    }
}

/// A unit of work read back from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Stream entry id; changes on every requeue
    pub id: TaskId,
    /// Payload exactly as stored
    pub data_string: String,
    /// Deserialized payload
    pub data: Value,
    /// Dedup key, empty when the task was submitted without one
    pub dedup_key: String,
    /// Number of prior failed attempts in this task chain
    pub retry_count: u32,
}

impl Task {
    /// Build a task from its entry id and validated raw fields.
    ///
    /// Fails with [`SmithError::Validation`] if the id is empty or the payload
    /// is not valid JSON.
    pub fn new(id: impl Into<TaskId>, raw: RawTask) -> SmithResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SmithError::validation("Task requires an ID"));
        }

        let data = serde_json::from_str(&raw.data)
            .map_err(|e| SmithError::validation(format!("Task data is not valid JSON: {e}")))?;

        Ok(Self {
            id,
            data_string: raw.data,
            data,
            dedup_key: raw.dedup_key,
            retry_count: raw.retry_count,
        })
    }

    /// Build a task from a stream entry.
    pub fn from_fields(id: impl Into<TaskId>, entry: &HashMap<String, String>) -> SmithResult<Self> {
        Self::new(id, RawTask::from_fields(entry)?)
    }

    /// Increment the retry count by one. Always followed by a requeue.
    pub fn incr_retry(&mut self) {
        self.retry_count += 1;
    }

    /// The dedup key, if the task has one.
    pub fn dedup(&self) -> Option<&str> {
        (!self.dedup_key.is_empty()).then_some(self.dedup_key.as_str())
    }

    /// Handler-facing metadata for this delivery.
    pub fn metadata(&self, qname: &str, consumer_name: &str) -> TaskMetadata {
        TaskMetadata {
            id: self.id.clone(),
            qname: qname.to_string(),
            retry_count: self.retry_count,
            consumer_name: consumer_name.to_string(),
        }
    }
}

/// Metadata passed to the handler alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Entry id of this delivery
    pub id: TaskId,
    /// Queue name
    pub qname: String,
    /// Number of prior failed attempts
    pub retry_count: u32,
    /// Identity of the consumer running the handler
    pub consumer_name: String,
}

/// A task submitted through [`Producer::bulk_add_tasks`](crate::producer::Producer::bulk_add_tasks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask<T> {
    /// Payload, serialized to JSON on submission
    pub data: T,
    /// Optional dedup key
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl<T> NewTask<T> {
    /// A task without a dedup key.
    pub fn new(data: T) -> Self {
        Self {
            data,
            dedup_key: None,
        }
    }

    /// Attach a dedup key.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}
