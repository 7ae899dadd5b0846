//! Turning a failed background task into the `error` field of its
//! envelope.

use std::panic::{self, AssertUnwindSafe};

use hostbridge_types::{EndpointError, StructuredError, TaskError};

/// Message used when the installed classifier itself panics.
pub const CLASSIFIER_CRASHED: &str = "Error handler crashed";
/// Message used when a failure carries nothing printable.
pub const UNKNOWN_ERROR: &str = "Unknown Error";

/// How a background task failed.
#[derive(Debug)]
pub enum TaskFailure {
    /// The task returned `Err`.
    Error(anyhow::Error),
    /// The task panicked. Holds the payload text when it was a string.
    Panic(Option<String>),
}

impl TaskFailure {
    /// Printable description, including the full context chain for errors.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Error(err) => Some(format!("{err:#}")),
            Self::Panic(message) => message.clone(),
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Error(err) => Some(err),
            Self::Panic(_) => None,
        }
    }
}

/// Recognizes domain failures and turns them into the structured error
/// shape. Returning `None` falls back to a plain message.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, failure: &TaskFailure) -> Option<StructuredError>;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&TaskFailure) -> Option<StructuredError> + Send + Sync,
{
    fn classify(&self, failure: &TaskFailure) -> Option<StructuredError> {
        self(failure)
    }
}

/// Finds an [`EndpointError`] anywhere in the error's context chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointErrorClassifier;

impl ErrorClassifier for EndpointErrorClassifier {
    fn classify(&self, failure: &TaskFailure) -> Option<StructuredError> {
        failure
            .as_error()?
            .chain()
            .find_map(|cause| cause.downcast_ref::<EndpointError>())
            .map(EndpointError::to_structured)
    }
}

pub(crate) fn describe_failure(
    classifier: Option<&dyn ErrorClassifier>,
    failure: &TaskFailure,
) -> TaskError {
    if let Some(classifier) = classifier {
        match panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(failure))) {
            Ok(Some(structured)) => return TaskError::Structured(structured),
            Ok(None) => {}
            Err(_) => {
                tracing::error!("Error classifier panicked");
                return TaskError::message(CLASSIFIER_CRASHED);
            }
        }
    }
    TaskError::message(
        failure
            .message()
            .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
    )
}
