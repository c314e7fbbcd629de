//! Collaborator ports
//!
//! Extraction, scoring and reporting are done by external collaborators
//! (model calls, heuristics). The pipeline only sees these narrow traits and
//! the fact types they return.

use async_trait::async_trait;
use kgraph_store::{Batch, Item, ItemState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::RunContext;

#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Collaborator answered but the answer is unusable for this item
    #[error("Malformed extraction output: {0}")]
    Malformed(String),

    #[error("Extraction service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;

// ═══════════════════════════════════════════════════════════════════════════
// Facts
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RightsFacts {
    pub contributor: String,
    pub license: String,
    /// 0.0 ..= 1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexiconTerm {
    pub term: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFact {
    pub pool: String,
    pub name: String,
}

/// Relation endpoint `(pool, name)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub pool: String,
    pub name: String,
}

impl EntityRef {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationFact {
    pub source: EntityRef,
    pub verb: String,
    pub target: EntityRef,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extractors (item level)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait RightsExtractor: Send + Sync {
    async fn extract(&self, content: &str, ctx: &RunContext) -> ExtractionResult<RightsFacts>;
}

#[async_trait]
pub trait LexiconExtractor: Send + Sync {
    async fn extract(&self, content: &str, ctx: &RunContext)
        -> ExtractionResult<Vec<LexiconTerm>>;
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, content: &str, ctx: &RunContext) -> ExtractionResult<Vec<EntityFact>>;
}

#[async_trait]
pub trait RelationExtractor: Send + Sync {
    async fn extract(&self, content: &str, ctx: &RunContext)
        -> ExtractionResult<Vec<RelationFact>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch-level collaborators (stages 7-9)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ScoringCollaborator: Send + Sync {
    /// Literacy score; the controller clamps it to `[0, 1]`
    async fn score(&self, batch: &Batch, items: &[Item], ctx: &RunContext) -> anyhow::Result<f64>;
}

#[async_trait]
pub trait DeliverablesCollaborator: Send + Sync {
    async fn produce(
        &self,
        batch: &Batch,
        items: &[Item],
        ctx: &RunContext,
    ) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait NavigatorCollaborator: Send + Sync {
    async fn build(
        &self,
        batch: &Batch,
        items: &[Item],
        ctx: &RunContext,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Default scorer: share of items that made it through every item stage
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionRatioScorer;

#[async_trait]
impl ScoringCollaborator for CompletionRatioScorer {
    async fn score(&self, _batch: &Batch, items: &[Item], _ctx: &RunContext) -> anyhow::Result<f64> {
        if items.is_empty() {
            return Ok(0.0);
        }
        let complete = items
            .iter()
            .filter(|i| i.state == ItemState::Complete)
            .count();
        Ok(complete as f64 / items.len() as f64)
    }
}
