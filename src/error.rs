use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WelesError {
    #[error("Malformed job specification: {0}")]
    MalformedSpec(String),

    #[error("Invalid artifact description: {0}")]
    InvalidDescription(String),

    #[error("Invalid cursor: no record with ID {0}")]
    InvalidCursor(u64),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("No dispatch found for job {0}")]
    DispatchNotFound(u64),

    #[error("Job {0} already has an active dispatch")]
    AlreadyRunning(u64),

    #[error("Job {0} is already in a terminal state")]
    AlreadyTerminal(u64),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Job registry is at capacity ({0} jobs)")]
    RegistryFull(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error category exposed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ResourceUnavailable,
    Internal,
}

impl WelesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WelesError::MalformedSpec(_)
            | WelesError::InvalidDescription(_)
            | WelesError::InvalidCursor(_) => ErrorKind::Validation,
            WelesError::JobNotFound(_)
            | WelesError::ArtifactNotFound(_)
            | WelesError::DispatchNotFound(_) => ErrorKind::NotFound,
            WelesError::AlreadyRunning(_) | WelesError::AlreadyTerminal(_) => ErrorKind::Conflict,
            WelesError::ResourceUnavailable(_) | WelesError::RegistryFull(_) => {
                ErrorKind::ResourceUnavailable
            }
            WelesError::Io(_) | WelesError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, WelesError>;

/// Failure inside an asynchronous worker.
///
/// Never returned to API callers: workers render it into the message of a
/// terminal status event.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("unsupported URI: {0}")]
    UnsupportedUri(String),

    #[error("invalid job configuration: {0}")]
    Parse(String),

    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("{failed} of {total} test cases failed")]
    TestsFailed { failed: usize, total: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("canceled")]
    Canceled,

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            WorkerError::Canceled
        } else {
            WorkerError::Panicked(err.to_string())
        }
    }
}
