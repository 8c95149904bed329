//! Error types for the sync engine.

use crate::backend::BackendError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] tidemark_store::StoreError),

    /// Entity snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend call failed.
    #[error("backend error: {message}")]
    Backend {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Credentials are expired or invalid; pushes halt until refreshed.
    #[error("re-authentication required: {0}")]
    AuthRequired(String),

    /// No authenticated user is set.
    #[error("no authenticated user")]
    NoUser,

    /// The pull phase failed after exhausting its retries.
    #[error("pull failed after {attempts} attempts: {message}")]
    PullExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },
}

impl EngineError {
    /// Creates a retryable backend error.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Backend { retryable: true, .. })
    }
}

impl From<BackendError> for EngineError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unauthorized(message) => EngineError::AuthRequired(message),
            BackendError::Transient(message) => EngineError::Backend {
                message,
                retryable: true,
            },
            other => EngineError::Backend {
                message: other.to_string(),
                retryable: false,
            },
        }
    }
}
