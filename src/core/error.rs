use thiserror::Error;

/// Core error type shared across the praxis layers.
///
/// Uses `thiserror` with `#[source]` annotations so the underlying
/// serde errors stay on the error chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value or event to JSON.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding JSON. This also covers
    /// events carrying an unknown `type` tag, which must be rejected.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
