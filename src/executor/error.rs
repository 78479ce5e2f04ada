use crate::core::CoreError;
use thiserror::Error;

/// Execution layer error type.
///
/// Registry lookups and argument conversion fail here; the worker records
/// these as task-level failures (history events) rather than crashing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// No workflow function registered under this name.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No activity function registered under this name.
    #[error("activity not found: {0}")]
    ActivityNotFound(String),

    /// The delivered inputs do not match the registered function's arity.
    #[error("mismatched argument count: expected {expected}, got {got}")]
    ArgumentMismatch { expected: usize, got: usize },

    /// A workflow or activity is already registered under this name.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Payload (de)serialization failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
