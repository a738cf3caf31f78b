//! Error types for diary-core

use thiserror::Error;

/// Result type alias using diary-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in local diary-core operations
///
/// Remote failures never surface here; they are classified by
/// [`crate::sync::RemoteError`] and kept inside the sync engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry or queued action not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
