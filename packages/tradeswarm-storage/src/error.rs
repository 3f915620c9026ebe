//! Error types for tradeswarm-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// A complete record already exists for the key
    DuplicateRecord,
    /// Session not found
    SessionNotFound,
    /// The writer queue is closed (store shut down)
    WriterClosed,
    /// Configuration errors
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::DuplicateRecord => "duplicate_record",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::WriterClosed => "writer_closed",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn duplicate_record(session_id: impl fmt::Display, output_kind: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::DuplicateRecord,
            format!(
                "Complete record already exists for ({}, {})",
                session_id, output_kind
            ),
        )
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("Session not found: {}", session_id.into()),
        )
    }

    pub fn writer_closed() -> Self {
        Self::new(ErrorKind::WriterClosed, "Coordination writer is not running")
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Irrecoverable storage fault (disk, corruption, dead writer).
    ///
    /// Admission rejections such as [`ErrorKind::DuplicateRecord`] are not faults:
    /// the store is healthy and simply refused the write.
    pub fn is_fault(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Database | ErrorKind::IO | ErrorKind::WriterClosed | ErrorKind::Serialization
        )
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("IO error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
