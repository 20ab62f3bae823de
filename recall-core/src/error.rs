use serde::Serialize;
use thiserror::Error;

use crate::index::IndexError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query issued outside an open transaction")]
    NoActiveTransaction,

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Vector store error: {0}")]
    Other(String),
}

/// Failure category, for callers that branch on the kind of error rather
/// than the concrete cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Database,
    Index,
    Connection,
    Transaction,
    Other,
}

impl ErrorKind {
    /// Stable error code used on the IPC wire.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Connection => "E1001",
            ErrorKind::Database => "E1002",
            ErrorKind::Transaction => "E1003",
            ErrorKind::Validation => "E3003",
            ErrorKind::Index => "E5001",
            ErrorKind::Other => "E9999",
        }
    }
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    /// Wire code. Pool exhaustion is a connection failure with its own code.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Pool(_) => "E1004",
            other => other.kind().code(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::Database(_) => ErrorKind::Database,
            StoreError::Index(_) => ErrorKind::Index,
            StoreError::Connection(_) | StoreError::Pool(_) => ErrorKind::Connection,
            StoreError::NoActiveTransaction => ErrorKind::Transaction,
            StoreError::Config(_)
            | StoreError::Io(_)
            | StoreError::Serialization(_)
            | StoreError::Other(_) => ErrorKind::Other,
        }
    }

    /// True for failures worth retrying: lock contention and transient I/O.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            StoreError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }

    /// False for failures that another attempt cannot fix: bad input,
    /// transaction misuse, missing rows and constraint violations.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Validation(_)
            | StoreError::NoActiveTransaction
            | StoreError::Pool(_)
            | StoreError::Config(_)
            | StoreError::Serialization(_) => false,
            StoreError::Database(sqlx::Error::RowNotFound) => false,
            StoreError::Database(sqlx::Error::Database(db)) => {
                !(db.is_unique_violation() || db.is_check_violation())
            }
            _ => true,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
