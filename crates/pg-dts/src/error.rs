//! Error types for the data transfer service.

use thiserror::Error;

/// Main error type for DTS operations.
#[derive(Error, Debug)]
pub enum DtsError {
    /// Invalid caller input (missing fields, malformed table names, etc.)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task with the same id already exists.
    #[error("Task {0} already exists")]
    AlreadyExists(String),

    /// The task (or another named object) was not found.
    #[error("Task {0} not found")]
    NotFound(String),

    /// The requested state transition is not legal from the current state.
    #[error("Illegal transition from '{from}': {reason}")]
    IllegalTransition { from: String, reason: String },

    /// A migration precondition does not hold (wal_level, missing table, ...).
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Database error from either side of the transfer or the metadata store.
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// Connection pool error with context about where it occurred.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Schema introspection or DDL replay failed.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Bulk copy failed for a specific table.
    #[error("Copy failed for table {table}: {message}")]
    Copy { table: String, message: String },

    /// Replication slot / publication / stream error.
    #[error("Replication error: {0}")]
    Replication(String),

    /// The pgoutput stream carried bytes we could not decode.
    #[error("WAL decode error: {0}")]
    WalDecode(#[from] crate::wal::DecodeError),

    /// Configuration error (invalid YAML, bad values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (config file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The task was cancelled (stop/delete or server shutdown).
    #[error("task cancelled")]
    Cancelled,
}

impl DtsError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        DtsError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Copy error for a table.
    pub fn copy(table: impl Into<String>, message: impl ToString) -> Self {
        DtsError::Copy {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// True for errors caused by caller input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DtsError::Validation(_)
                | DtsError::AlreadyExists(_)
                | DtsError::IllegalTransition { .. }
        )
    }
}

/// Result type alias for DTS operations.
pub type Result<T> = std::result::Result<T, DtsError>;
