use std::fmt;

use thiserror::Error;

use crate::database::StoreError;

/// Why a task run did not succeed.
///
/// The distinction decides what happens to the delivery: permanent failures
/// are acknowledged and never retried, transient ones are left to the queue
/// service's redelivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("permanent task failure: {0}")]
    Permanent(String),

    #[error("task failed: {0}")]
    Transient(String),
}

impl TaskError {
    pub fn permanent(reason: impl fmt::Display) -> Self {
        Self::Permanent(reason.to_string())
    }

    pub fn transient(reason: impl fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            // Nothing left to run; a retry cannot change that.
            StoreError::NotFound(_) => Self::permanent(err),
            StoreError::Backend(_) => Self::transient(err),
        }
    }
}

impl From<DecodeError> for TaskError {
    fn from(err: DecodeError) -> Self {
        Self::permanent(err)
    }
}

/// Failures reported by the hosted queue's create-task call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The task body exceeds what the queue accepts.
    #[error("task size too large: {0}")]
    PayloadTooLarge(String),

    #[error("queue transport error: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("'using' is not a valid connection: `{alias}` not in {}", .known.join(","))]
    UnknownConnection { alias: String, known: Vec<String> },

    #[error("countdown must be a positive number of seconds")]
    InvalidCountdown,
}

/// A delivered payload that cannot be turned back into a runnable task.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed task payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unsupported task payload version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("unknown task type `{0}`")]
    UnknownType(String),

    #[error("invalid fields for task type `{kind}`: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything [`Deferrer::defer`](super::Deferrer::defer) can fail with.
#[derive(Debug, Error)]
pub enum DeferError {
    /// The task type is not registered, so no consumer could ever run it.
    #[error("task type `{0}` is not registered as runnable")]
    ContractViolation(&'static str),

    #[error(transparent)]
    InvalidOptions(#[from] OptionsError),

    #[error("failed to serialize task payload: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("task payload of {size} bytes is too large for the queue and the task is marked small-only")]
    PayloadTooLarge { size: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
