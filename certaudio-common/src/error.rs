//! Common error types for certaudio

use thiserror::Error;

/// Common result type for certaudio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across certaudio crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of a persisted column or snapshot
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the underlying SQLite connection reported lock contention
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
