use crate::core::CoreError;
use thiserror::Error;

/// Backend layer error type.
///
/// Backend operations either succeed fully or leave storage unchanged;
/// partial failures are converted into one of these variants before
/// returning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// A workflow instance with the same `(instance_id, execution_id)`
    /// already exists.
    #[error("workflow instance already exists")]
    InstanceAlreadyExists,

    /// The workflow instance does not exist or has already finished.
    #[error("workflow instance not found")]
    InstanceNotFound,

    /// The task lease expired or was stolen; the caller must discard its
    /// results and let the task be redelivered.
    #[error("task lease lost")]
    LeaseLost,

    /// The instance passed to a checkpoint does not match the instance the
    /// task was delivered for.
    #[error("task instance does not match checkpoint instance")]
    InstanceMismatch,

    /// Event or payload (de)serialization failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The backing store is unreachable or returned a transport error.
    /// Workers treat this as retriable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;
