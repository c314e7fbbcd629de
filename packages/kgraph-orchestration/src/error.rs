use kgraph_store::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::embedding::EmbeddingError;
use crate::graph::GraphError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Broken precondition (eligible items left unprocessed, entity without
    /// rights). Fatal for the stage.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("Batch {0} is already running")]
    BatchBusy(Uuid),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Retry classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Storage(_) => ErrorCategory::Infrastructure,
            PipelineError::Graph(e) if e.is_transient() => ErrorCategory::Infrastructure,
            PipelineError::Graph(_) => ErrorCategory::Permanent,
            PipelineError::Embedding(e) if e.is_transient() => ErrorCategory::Transient,
            PipelineError::Embedding(_) => ErrorCategory::Permanent,
            PipelineError::BatchBusy(_) => ErrorCategory::Transient,
            PipelineError::InvariantViolation(_)
            | PipelineError::InvalidStateTransition { .. }
            | PipelineError::BatchNotFound(_)
            | PipelineError::Config(_)
            | PipelineError::Serialization(_)
            | PipelineError::Other(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, PipelineError::InvariantViolation(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e)
    }
}

/// How a failed unit of work may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retry as is: provider hiccup, batch held elsewhere
    Transient,
    /// Needs an operator or new input: invariant, bad config
    Permanent,
    /// Backing store unreachable; resume once it is back
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
