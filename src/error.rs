//! Error types for pipeline execution.

use std::time::Duration;

use thiserror::Error;

/// The main error type for pipeline operations.
///
/// An `Err` returned from [`Step::execute`](crate::Step::execute) is treated as
/// a fault: the step is not retried and the run stops. Steps that want another
/// attempt return a [`StepResult`](crate::StepResult) carrying a fault-free
/// error instead, or [`Error::Recoverable`] from a [`TypedStep`](crate::TypedStep).
#[derive(Error, Debug)]
pub enum Error {
    /// The pipeline was assembled incorrectly.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step failed in a way it cannot recover from.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A failure the step expects to correct on its next attempt.
    #[error("{0}")]
    Recoverable(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A time budget ran out.
    #[error("'{scope}' timed out after {after:?}")]
    Timeout {
        /// Name of the step or pipeline whose budget expired.
        scope: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// The caller cancelled the run.
    #[error("Execution cancelled")]
    Cancelled,

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Returns true if a step producing this error should get another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Recoverable(_) | Error::Validation(_))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
