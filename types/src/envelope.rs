//! The result envelope: the single wire contract between the engine and
//! whoever consumes background task results.

use serde::{Deserialize, Deserializer, Serialize};

use crate::{HostValue, TaskId};

/// Structured error sub-shape, produced by an error classifier for
/// recognized domain failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: i64,
    pub name: String,
    pub scope: String,
    pub description: String,
    pub full: String,
}

/// Failure payload of a [`ResultEnvelope`].
///
/// Serialized untagged: either the structured object or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskError {
    Structured(StructuredError),
    Message(String),
}

impl TaskError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Human-readable summary regardless of shape.
    #[must_use]
    pub fn summary(&self) -> &str {
        match self {
            Self::Structured(err) => &err.full,
            Self::Message(msg) => msg,
        }
    }
}

/// Outcome of one background task, `{taskId, status, result | error}`.
///
/// Exactly one of `result` / `error` is present; the constructors are the
/// only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "taskId")]
    task_id: TaskId,
    status: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    result: Option<HostValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
}

/// A `result` key that is present stays `Some`, even when it holds `null`
/// (the result of a task returning unit). Only a missing key is `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<HostValue>, D::Error>
where
    D: Deserializer<'de>,
{
    HostValue::deserialize(deserializer).map(Some)
}

impl ResultEnvelope {
    #[must_use]
    pub fn success(task_id: TaskId, result: HostValue) -> Self {
        Self {
            task_id,
            status: true,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(task_id: TaskId, error: TaskError) -> Self {
        Self {
            task_id,
            status: false,
            result: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[must_use]
    pub fn status(&self) -> bool {
        self.status
    }

    #[must_use]
    pub fn result(&self) -> Option<&HostValue> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Render as the JSON object handed to the host.
    #[must_use]
    pub fn to_value(&self) -> HostValue {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "taskId": self.task_id,
                "status": false,
                "error": format!("failed to encode envelope: {e}"),
            })
        })
    }
}
