use async_trait::async_trait;
use kgraph_store::{
    BatchStatus, Item, ItemStage, ItemStore, ItemTransition, LogLevel, QualityWarning, StageResult,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::Result;

/// What the handler made of one claimed item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Resolve the item now
    Resolved {
        result: StageResult,
        facts: Option<serde_json::Value>,
        metadata: serde_json::Value,
    },
    /// Keep the item claimed; `finish` decides what happens to it
    Deferred {
        facts: Option<serde_json::Value>,
        metadata: serde_json::Value,
    },
}

impl ItemOutcome {
    pub fn success(facts: serde_json::Value) -> Self {
        ItemOutcome::Resolved {
            result: StageResult::Success,
            facts: Some(facts),
            metadata: serde_json::Value::Null,
        }
    }

    /// Item-level failure; the reason is also kept as transition metadata
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        ItemOutcome::Resolved {
            metadata: serde_json::json!({ "error": reason }),
            result: StageResult::Failed(reason),
            facts: None,
        }
    }

    pub fn skipped(reason: impl Into<String>, metadata: serde_json::Value) -> Self {
        ItemOutcome::Resolved {
            result: StageResult::Skipped(reason.into()),
            facts: None,
            metadata,
        }
    }

    pub fn deferred(facts: Option<serde_json::Value>) -> Self {
        ItemOutcome::Deferred {
            facts,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A claimed item waiting for the stage's batch-level step
#[derive(Debug, Clone)]
pub struct DeferredItem {
    /// State is `InProgress(stage)`
    pub item: Item,
    pub facts: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

/// Aggregates of one `advance` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub selected: usize,
    /// Claimed and handed to the handler
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Left claimed for an asynchronous consumer
    pub deferred: usize,
}

impl StageSummary {
    pub fn record(&mut self, result: &StageResult) {
        match result {
            StageResult::Success => self.succeeded += 1,
            StageResult::Failed(_) => self.failed += 1,
            StageResult::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn ratio(&self, count: usize) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            count as f64 / self.processed as f64
        }
    }
}

/// What happens to deferred items after `finish`
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredDisposition {
    Resolve(StageResult),
    /// Back to `Pending(stage)`
    Release,
    /// Someone else resolves them (embedding monitor)
    Keep,
}

/// Batch-level result of a stage
#[derive(Debug, Clone)]
pub struct StageVerdict {
    /// New batch status; `None` leaves it unchanged
    pub status: Option<BatchStatus>,
    pub deferred: DeferredDisposition,
    /// Merged into the stage's entry of `Batch::stats`
    pub stats: serde_json::Value,
    pub warnings: Vec<QualityWarning>,
    pub logs: Vec<(LogLevel, String)>,
    /// Embedding jobs submitted by the stage
    pub jobs: Vec<Uuid>,
}

impl StageVerdict {
    pub fn completed(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            deferred: DeferredDisposition::Resolve(StageResult::Success),
            stats: serde_json::json!({}),
            warnings: Vec::new(),
            logs: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: serde_json::Value) -> Self {
        self.stats = stats;
        self
    }

    pub fn log(mut self, level: LogLevel, message: impl Into<String>) -> Self {
        self.logs.push((level, message.into()));
        self
    }
}

/// Item-level stage (triage, lexicon, pool, graph, embedding)
#[async_trait]
pub trait ItemStageHandler: Send + Sync {
    fn stage(&self) -> ItemStage;

    /// Process one claimed item. Item-level problems are returned as a
    /// failed/skipped outcome; `Err` aborts the stage.
    async fn process(&self, ctx: &RunContext, item: &Item) -> Result<ItemOutcome>;

    /// Batch-level step after every selected item was processed
    async fn finish(
        &self,
        ctx: &RunContext,
        summary: &StageSummary,
        deferred: &[DeferredItem],
    ) -> Result<StageVerdict>;
}

/// Return a claimed item to `Pending(stage)`. `false` if its state moved on.
pub async fn release_item(store: &dyn ItemStore, item: &Item, actor: &str) -> Result<bool> {
    let transition = ItemTransition::release(&item.state, actor)?;
    Ok(store.transition_item(item.id, transition, None).await?)
}
