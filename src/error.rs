//! Error types for Capsule Memory

use thiserror::Error;

/// Result type alias for Capsule Memory operations
pub type Result<T> = std::result::Result<T, CapsuleError>;

/// Main error type for Capsule Memory
#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store not provisioned: {0}")]
    NotProvisioned(String),

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Hint appended to NotProvisioned responses on query surfaces (§7)
pub const NOT_PROVISIONED_HINT: &str =
    "the document store is unreachable; results are empty until it recovers";

impl CapsuleError {
    /// Check if the error is safe to retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapsuleError::Upstream(_) | CapsuleError::NotProvisioned(_)
        )
    }

    /// HTTP status code for the request surface (§6, §7)
    pub fn http_status(&self) -> u16 {
        match self {
            CapsuleError::InvalidArgument(_) => 400,
            CapsuleError::Unauthorized(_) => 401,
            CapsuleError::NotFound(_) => 404,
            CapsuleError::InvalidState(_) => 409,
            CapsuleError::Conflict(_) => 200,
            CapsuleError::NotProvisioned(_) => 500,
            CapsuleError::Upstream(_) => 502,
            CapsuleError::Database(_)
            | CapsuleError::Serialization(_)
            | CapsuleError::Io(_)
            | CapsuleError::Http(_)
            | CapsuleError::Encryption(_)
            | CapsuleError::Config(_)
            | CapsuleError::Internal(_) => 500,
        }
    }
}
