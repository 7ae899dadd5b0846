use hostbridge_types::{CallId, HostValue};
use thiserror::Error;

use crate::config::ConfigError;

/// The target loop no longer accepts work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("thread '{thread}' is no longer accepting work")]
pub struct DispatchError {
    thread: String,
}

impl DispatchError {
    pub(crate) fn closed(thread: &str) -> Self {
        Self {
            thread: thread.to_string(),
        }
    }

    #[must_use]
    pub fn thread(&self) -> &str {
        &self.thread
    }
}

/// Why a bridged call did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The host invoked the error entry point.
    #[error("{message}")]
    Host { message: String, value: HostValue },
    #[error("call {0} timed out waiting for the host")]
    TimedOut(CallId),
    #[error("call {0} was cancelled")]
    Cancelled(CallId),
    /// The engine shut down (or the completion slot was dropped) before the
    /// host replied.
    #[error("call {0} was abandoned before the host replied")]
    Abandoned(CallId),
    #[error("starter for call {id} panicked: {message}")]
    StarterPanicked { id: CallId, message: String },
    #[error("failed to decode host reply: {0}")]
    Decode(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl CallError {
    /// Build a host rejection, stringifying the opaque value best-effort.
    #[must_use]
    pub fn from_host(value: HostValue) -> Self {
        let message = match &value {
            HostValue::String(s) => s.clone(),
            HostValue::Object(map) => match map.get("message").and_then(HostValue::as_str) {
                Some(msg) => msg.to_string(),
                None => value.to_string(),
            },
            HostValue::Null => "Unknown host error".to_string(),
            other => other.to_string(),
        };
        Self::Host { message, value }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn thread '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
