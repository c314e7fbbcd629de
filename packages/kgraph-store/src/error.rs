//! Item store errors
//!
//! One error struct with a coarse `ErrorKind`; callers branch on the kind,
//! operators read the message.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend failure (SQLite)
    Database,
    /// A stored row or JSON column could not be decoded
    Serialization,
    BatchNotFound,
    ItemNotFound,
    /// A transition the item state machine does not allow
    InvalidTransition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::BatchNotFound => "batch_not_found",
            ErrorKind::ItemNotFound => "item_not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    fn caused_by(
        kind: ErrorKind,
        prefix: &str,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: format!("{}: {}", prefix, cause),
            source: Some(Box::new(cause)),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn batch_not_found(batch_id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::BatchNotFound, format!("no batch {}", batch_id))
    }

    pub fn item_not_found(item_id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ItemNotFound, format!("no item {}", item_id))
    }

    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidTransition,
            format!("item cannot move from {} to {}", from, to),
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::BatchNotFound | ErrorKind::ItemNotFound)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::caused_by(ErrorKind::Database, "sqlite", err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::caused_by(ErrorKind::Serialization, "json column", err)
    }
}

impl From<uuid::Error> for StorageError {
    fn from(err: uuid::Error) -> Self {
        Self::caused_by(ErrorKind::Serialization, "uuid column", err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
