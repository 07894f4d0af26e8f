//! Outcome records appended to the result, failed and dead lists.

use crate::error::SmithError;
use crate::task::{Task, fields};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which bookkeeping list an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Handler returned a result
    Success,
    /// Handler failed; recorded for every failed attempt
    Failure,
    /// Retries exhausted or the record was malformed
    Dead,
}

impl OutcomeKind {
    /// Suffix of the list key.
    pub fn list_name(self) -> &'static str {
        match self {
            Self::Success => "results",
            Self::Failure => "failed",
            Self::Dead => "dead",
        }
    }
}

/// Serializable description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Classification, e.g. `TimeoutError`
    pub name: String,
    /// Display message
    pub message: String,
    /// Messages of the error's source chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl From<&SmithError> for ErrorInfo {
    fn from(err: &SmithError) -> Self {
        let mut chain = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            name: err.name().to_string(),
            message: err.to_string(),
            chain,
        }
    }
}

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Value returned by the handler
    Result(Value),
    /// Failure description
    Error(ErrorInfo),
}

/// One entry of an outcome list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    /// Entry id of the attempt
    pub id: String,
    /// Queue name
    pub qname: String,
    /// Payload
    pub data: Value,
    /// Dedup key, empty when absent
    pub dedup_key: String,
    /// Retry count of the attempt
    pub retry_count: u32,
    /// Result or error
    #[serde(flatten)]
    pub outcome: Outcome,
    /// When the outcome was recorded
    pub at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Record a successful attempt.
    pub fn success(task: &Task, qname: &str, result: Value) -> Self {
        Self::build(task, qname, Outcome::Result(result))
    }

    /// Record a failed attempt.
    pub fn failure(task: &Task, qname: &str, err: &SmithError) -> Self {
        Self::build(task, qname, Outcome::Error(err.into()))
    }

    /// Record a stream entry that could not be read as a task.
    ///
    /// The raw `data` field is kept as JSON when it parses and as a string otherwise.
    pub fn rejected(
        id: &str,
        qname: &str,
        entry: &HashMap<String, String>,
        err: &SmithError,
    ) -> Self {
        let data = entry.get(fields::DATA).map_or(Value::Null, |raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        });

        Self {
            id: id.to_string(),
            qname: qname.to_string(),
            data,
            dedup_key: entry.get(fields::DEDUP_KEY).cloned().unwrap_or_default(),
            retry_count: entry
                .get(fields::RETRY_COUNT)
                .and_then(|n| n.parse().ok())
                .unwrap_or_default(),
            outcome: Outcome::Error(err.into()),
            at: Utc::now(),
        }
    }

    fn build(task: &Task, qname: &str, outcome: Outcome) -> Self {
        Self {
            id: task.id.clone(),
            qname: qname.to_string(),
            data: task.data.clone(),
            dedup_key: task.dedup_key.clone(),
            retry_count: task.retry_count,
            outcome,
            at: Utc::now(),
        }
    }

    /// The result, if this is a success record.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    /// The error, if this is a failure record.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match &self.outcome {
            Outcome::Error(info) => Some(info),
            Outcome::Result(_) => None,
        }
    }
}
