//! Boundary types for hostbridge.
//!
//! Plain data that crosses between native callers, the engine, and the
//! host: identifiers, the thread-target selector, and the result envelope.
//! No IO, no threads.

mod envelope;
mod error;
mod ids;

pub use envelope::{ResultEnvelope, StructuredError, TaskError};
pub use error::EndpointError;
pub use ids::{CallId, TaskId};

/// Opaque value exchanged with the host.
pub type HostValue = serde_json::Value;

/// Destination for a bridged call's starter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadTarget {
    /// The host's single thread.
    #[default]
    Main,
    /// The engine's task-manager thread.
    Worker,
}
