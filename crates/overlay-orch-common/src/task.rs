//! Job processing status and error types.

use thiserror::Error;

/// Outcome classification of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Job completed successfully
    Success,
    /// Job input was malformed and will never succeed
    InvalidEntry,
    /// Job failed (generic)
    Failed,
    /// Job should be run again
    NeedRetry,
    /// Job was intentionally skipped
    Ignore,
    /// Job is parked until a dependency shows up
    WaitingForDependency,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::InvalidEntry | TaskStatus::Failed)
    }
}

/// Error returned by a job closure.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    /// Routing store or flow backend transaction failed.
    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Retry needed: {reason}")]
    NeedRetry { reason: String },

    #[error("Waiting for dependency: {dependency}")]
    WaitingForDependency { dependency: String },

    #[error("Ignored: {reason}")]
    Ignored { reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        TaskError::Backend {
            message: message.into(),
        }
    }

    pub fn need_retry(reason: impl Into<String>) -> Self {
        TaskError::NeedRetry {
            reason: reason.into(),
        }
    }

    pub fn waiting_for(dependency: impl Into<String>) -> Self {
        TaskError::WaitingForDependency {
            dependency: dependency.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            // A failed transaction left nothing half-installed, so running
            // the whole job again is safe.
            TaskError::Backend { .. } => TaskStatus::NeedRetry,
            TaskError::NeedRetry { .. } => TaskStatus::NeedRetry,
            TaskError::WaitingForDependency { .. } => TaskStatus::WaitingForDependency,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
            TaskError::Internal { .. } => TaskStatus::Failed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.to_status().is_retryable()
    }
}

/// Result type for job closures.
pub type TaskResult<T> = Result<T, TaskError>;
