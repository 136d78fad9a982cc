//! Error types for the namespace interface repository

use thiserror::Error;

use crate::domain::NamespaceId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving namespace interfaces
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Protocol Errors
    // =========================================================================
    /// The factory could not build the interface
    #[error("Failed to construct interface for namespace {namespace_id}: {reason}")]
    ConstructionFailed {
        namespace_id: NamespaceId,
        reason: String,
    },

    /// The caller's cancellation token fired while waiting
    #[error("Operation cancelled")]
    Cancelled,

    /// The repository has begun shutting down
    #[error("Namespace repository is shutting down")]
    RepoShuttingDown,

    /// The access handle does not refer to any cache entry
    #[error("Access handle is empty")]
    EmptyAccess,

    // =========================================================================
    // Shard Errors
    // =========================================================================
    /// The target execution shard is not running
    #[error("Execution shard {0} is unavailable")]
    ShardUnavailable(usize),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Messaging error
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata file parse error
    #[error("Failed to parse metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a fresh request for the same namespace may succeed.
    ///
    /// Retry policy belongs to callers; the cache itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConstructionFailed { .. } | Error::Messaging(_))
    }
}
