//! Error types for registry operations.
//!
//! `Conflict` and `NotFound` are expected outcomes of optimistic concurrency
//! and are returned to the caller without being logged as failures.

use thiserror::Error;

/// Errors that can occur during registry and store operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No live object exists at the key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A live object already exists at the key.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected version does not match the stored version.
    #[error("conflict on {key}: expected version {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// Kind-specific validation rejected the object.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Object could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The underlying key-value store failed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Key is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The registry context has been shut down; writes are rejected.
    #[error("registry is shut down")]
    ShutDown,

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// A cloud or node agent call failed.
    #[error("cloud error: {0}")]
    Cloud(String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// Returns true if the caller may retry after re-reading current state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Conflict { .. } | RegistryError::StoreUnavailable(_)
        )
    }

    /// Returns true for the expected optimistic-concurrency outcomes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Encoding(err.to_string())
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        RegistryError::StoreUnavailable(err.to_string())
    }
}
