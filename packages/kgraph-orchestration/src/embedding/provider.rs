//! Embedding provider port
//!
//! Batch API shape: submit a file of requests keyed by custom id, poll the
//! job, then download an output file (vectors) and an error file (custom
//! ids that failed). `embed_one` is the synchronous single-text endpoint
//! used for fallback.

use async_trait::async_trait;
use kgraph_store::EmbeddingJobStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding request rejected: {0}")]
    Rejected(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Item id
    pub custom_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: EmbeddingJobStatus,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
}

impl JobStatusReport {
    pub fn new(status: EmbeddingJobStatus) -> Self {
        Self {
            status,
            output_file_id: None,
            error_file_id: None,
        }
    }

    pub fn with_output(mut self, file_id: impl Into<String>) -> Self {
        self.output_file_id = Some(file_id.into());
        self
    }

    pub fn with_errors(mut self, file_id: impl Into<String>) -> Self {
        self.error_file_id = Some(file_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub custom_id: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingFailure {
    pub custom_id: String,
    pub message: String,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Submit one batch job; returns the provider's job id
    async fn submit_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<String, EmbeddingError>;

    async fn get_job_status(&self, provider_job_id: &str) -> Result<JobStatusReport, EmbeddingError>;

    async fn fetch_output(&self, file_id: &str) -> Result<Vec<EmbeddingOutput>, EmbeddingError>;

    async fn fetch_errors(&self, file_id: &str) -> Result<Vec<EmbeddingFailure>, EmbeddingError>;

    /// Synchronous single embedding
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}
