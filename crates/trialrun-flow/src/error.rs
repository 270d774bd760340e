//! Error types for the run orchestration domain.
//!
//! Every rejection carries an [`ErrorKind`] and a human-readable reason.
//! Failures from blob storage and the message bus are translated at the
//! boundary into [`Error::StorageUnavailable`] and
//! [`Error::DispatchUnavailable`].

use std::fmt;

use trialrun_core::RunId;

/// The result type used throughout trialrun-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], suitable for mapping to transport
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied an invalid request.
    Validation,
    /// Policy refused to admit the run.
    AdmissionDenied,
    /// Blob storage or run repository is temporarily unavailable.
    StorageUnavailable,
    /// Blob storage refused the payload.
    StorageRejected,
    /// The message bus refused or failed a publish.
    DispatchUnavailable,
    /// The requested lifecycle event is not legal for the current status.
    InvalidTransition,
    /// The run does not exist.
    NotFound,
    /// Optimistic concurrency retries were exhausted.
    Conflict,
    /// The caller cancelled the operation.
    Cancelled,
    /// Persisted state could not be encoded or decoded.
    Serialization,
    /// Configuration is invalid.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "ValidationError",
            Self::AdmissionDenied => "AdmissionDenied",
            Self::StorageUnavailable => "StorageUnavailable",
            Self::StorageRejected => "StorageRejected",
            Self::DispatchUnavailable => "DispatchUnavailable",
            Self::InvalidTransition => "InvalidTransition",
            Self::NotFound => "NotFound",
            Self::Conflict => "Conflict",
            Self::Cancelled => "Cancelled",
            Self::Serialization => "Serialization",
            Self::Configuration => "Configuration",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request is malformed or conflicts with stored data.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// The policy gate denied admission. The run is now `FAILED`.
    #[error("admission denied for run {run_id}: {reason}")]
    AdmissionDenied {
        /// The run that was refused.
        run_id: RunId,
        /// Why admission was denied.
        reason: String,
    },

    /// Storage failed transiently; the operation may be retried.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Storage refused the payload; retrying will not help.
    #[error("storage rejected: {message}")]
    StorageRejected {
        /// Description of the rejection.
        message: String,
    },

    /// Publishing a dispatch message failed. The run stays `QUEUED`.
    #[error("dispatch unavailable{}: {message}", run_suffix(.run_id.as_ref()))]
    DispatchUnavailable {
        /// The run whose dispatch failed, if known.
        run_id: Option<RunId>,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The lifecycle event is not legal in the run's current status.
    #[error("invalid transition from {from} on {event}: {reason}")]
    InvalidTransition {
        /// The current status.
        from: String,
        /// The rejected event.
        event: String,
        /// Why the event was rejected.
        reason: String,
    },

    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// Concurrent writers kept winning the optimistic version check.
    #[error("conflict updating run {run_id} after {attempts} attempts")]
    Conflict {
        /// The contended run.
        run_id: RunId,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The caller cancelled run creation before the IR was durable.
    #[error("run {run_id} creation cancelled")]
    Cancelled {
        /// The run that was cancelled.
        run_id: RunId,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
}

fn run_suffix(run_id: Option<&RunId>) -> String {
    run_id.map_or_else(String::new, |id| format!(" for run {id}"))
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a storage-unavailable error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage-unavailable error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an invalid-transition error.
    #[must_use]
    pub fn invalid_transition(
        from: impl fmt::Display,
        event: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            event: event.into(),
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::AdmissionDenied { .. } => ErrorKind::AdmissionDenied,
            Self::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            Self::StorageRejected { .. } => ErrorKind::StorageRejected,
            Self::DispatchUnavailable { .. } => ErrorKind::DispatchUnavailable,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::RunNotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageUnavailable | ErrorKind::DispatchUnavailable | ErrorKind::Conflict
        )
    }
}

impl From<trialrun_core::Error> for Error {
    fn from(err: trialrun_core::Error) -> Self {
        Self::StorageUnavailable {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
