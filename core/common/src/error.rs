//! Common error types for rpmstore.

use thiserror::Error;

/// Top-level error type for storage operations.
///
/// Every variant is recoverable by the caller; none of them is meant to
/// abort the host process.
#[derive(Debug, Error)]
pub enum Error {
    /// No backend is registered under the requested name.
    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    /// A backend with this name is already registered.
    #[error("Duplicate storage backend: {0}")]
    DuplicateBackend(String),

    /// The handle does not refer to a stored blob.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The key is malformed or conflicts with an existing key.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Backend configuration is missing or malformed.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend-internal failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
