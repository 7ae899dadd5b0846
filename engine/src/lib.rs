//! Async call-correlation and dispatch engine for single-threaded hosts.
//!
//! [`BridgeEngine`] composes three pieces:
//!
//! - a [`WorkerPool`] for background compute, reporting each task through a
//!   result envelope posted to the main thread;
//! - named event-loop threads ([`EventLoop`], [`LoopThread`],
//!   [`ThreadHandle`]) for "run this exactly on thread X";
//! - a [`PendingCallTable`] correlating bridged host calls with the
//!   out-of-band `on_success` / `on_error` replies.

use std::any::Any;

mod cancel;
mod classify;
mod config;
mod deadline;
mod dispatch;
mod engine;
mod error;
mod pending;
mod pool;
mod stats;

pub use cancel::CancellationToken;
pub use classify::{
    CLASSIFIER_CRASHED, EndpointErrorClassifier, ErrorClassifier, TaskFailure, UNKNOWN_ERROR,
};
pub use config::{
    CONFIG_ENV_VAR, ConcurrencyLimit, ConfigError, EngineConfig, ThreadNames, config_path,
};
pub use dispatch::{EventLoop, LoopThread, ThreadHandle, current_thread_handle};
pub use engine::{BridgeEngine, BridgeEngineBuilder, CallOptions, CompletionPort, ResultSink};
pub use error::{CallError, DispatchError, EngineError};
pub use pending::{CallResult, EXPIRED_MEMORY, PendingCallTable, PendingReply, Settlement};
pub use pool::WorkerPool;
pub use stats::StatsSnapshot;

pub use hostbridge_types::{
    CallId, EndpointError, HostValue, ResultEnvelope, StructuredError, TaskError, TaskId,
    ThreadTarget,
};

/// Text of a panic payload, when it is a string.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some(*s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}
