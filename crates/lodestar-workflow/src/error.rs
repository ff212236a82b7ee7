//! Error types for the Lodestar workflow orchestrator.

use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Main error type for the orchestrator.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed definition or missing required configuration.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Illegal lifecycle transition.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Task execution failed inside an executor.
    #[error("Task execution failed: {task}, reason: {reason}")]
    TaskExecutionFailed { task: String, reason: String },

    /// A single executor invocation exceeded its time budget.
    #[error("Task execution timed out after {0} seconds")]
    ExecutionTimeout(u64),

    /// No executor registered for a task type.
    #[error("No executor registered for task type: {0}")]
    NoExecutor(String),

    /// Engine-level configuration problem (e.g. no strategy available).
    #[error("Engine configuration error: {0}")]
    Configuration(String),

    /// Queue operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(String),

    /// Malformed message at the transport boundary.
    #[error("Malformed transport payload: {0}")]
    Transport(String),

    /// Correlation id already assigned to another execution.
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    /// Workflow definition identity already registered.
    #[error("Duplicate workflow definition: {name} version {version}")]
    DuplicateDefinition { name: String, version: String },

    /// Retry budget exhausted.
    #[error("Retry attempts exhausted for task: {0}")]
    RetryExhausted(String),

    /// Internal orchestrator error.
    #[error("Internal orchestrator error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Returns true if a task failure with this error should enter the
    /// retry loop rather than fail terminally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::TaskExecutionFailed { .. }
                | WorkflowError::ExecutionTimeout(_)
                | WorkflowError::Queue(_)
                | WorkflowError::Internal(_)
        )
    }

    /// Returns true if the error fails a task terminally regardless of its
    /// remaining retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::Validation(_)
                | WorkflowError::Configuration(_)
                | WorkflowError::NoExecutor(_)
                | WorkflowError::InvalidStateTransition { .. }
        )
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = WorkflowError::TaskExecutionFailed {
            task: "extract".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        assert!(WorkflowError::ExecutionTimeout(30).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        let err = WorkflowError::Validation("missing key 'url'".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());

        assert!(WorkflowError::NoExecutor("shell".to_string()).is_fatal());
    }

    #[test]
    fn test_not_found_is_neither() {
        let err = WorkflowError::NotFound("wf-1".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }
}
