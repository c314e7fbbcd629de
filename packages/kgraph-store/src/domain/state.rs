//! Per-item stage state machine
//!
//! An item moves through the five item-level stages
//! (`triage → lexicon → pool → graph → embedding`) as a single state value.
//! The status of every individual stage is derived from that state, so an
//! item can never show a later stage as started while an earlier one has not
//! succeeded.
//!
//! ```text
//! Pending(s) ──claim──▶ InProgress(s) ──Success──▶ Pending(s+1) | Complete
//!      ▲                     │
//!      └─────release─────────┤──Failed(r)──▶ Failed(s)
//!                            └──Skipped(r)─▶ Skipped(s)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Item-level pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Triage,
    Lexicon,
    Pool,
    Graph,
    Embedding,
}

impl ItemStage {
    pub const ALL: [ItemStage; 5] = [
        ItemStage::Triage,
        ItemStage::Lexicon,
        ItemStage::Pool,
        ItemStage::Graph,
        ItemStage::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::Triage => "triage",
            ItemStage::Lexicon => "lexicon",
            ItemStage::Pool => "pool",
            ItemStage::Graph => "graph",
            ItemStage::Embedding => "embedding",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "triage" => Ok(ItemStage::Triage),
            "lexicon" => Ok(ItemStage::Lexicon),
            "pool" => Ok(ItemStage::Pool),
            "graph" => Ok(ItemStage::Graph),
            "embedding" => Ok(ItemStage::Embedding),
            _ => Err(StorageError::serialization(format!(
                "Invalid item stage: {}",
                s
            ))),
        }
    }

    /// Status token shown once the stage succeeded
    pub fn success_token(&self) -> &'static str {
        match self {
            ItemStage::Triage | ItemStage::Lexicon => "extracted",
            ItemStage::Pool => "pooled",
            ItemStage::Graph => "assembled",
            ItemStage::Embedding => "embedded",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<ItemStage> {
        ItemStage::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<ItemStage> {
        self.index().checked_sub(1).map(|i| ItemStage::ALL[i])
    }
}

impl std::fmt::Display for ItemStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one stage as seen from an item's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub const ALL: [StageStatus; 5] = [
        StageStatus::Pending,
        StageStatus::InProgress,
        StageStatus::Succeeded,
        StageStatus::Failed,
        StageStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Render with the stage-specific success token (`extracted`, `assembled`, ...)
    pub fn render(&self, stage: ItemStage) -> &'static str {
        match self {
            StageStatus::Succeeded => stage.success_token(),
            other => other.as_str(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}

/// Outcome of running one stage on one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum StageResult {
    Success,
    Failed(String),
    Skipped(String),
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success)
    }
}

/// Current state of an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    Pending { stage: ItemStage },
    InProgress { stage: ItemStage },
    Failed { stage: ItemStage, reason: String },
    Skipped { stage: ItemStage, reason: String },
    Complete,
}

impl Default for ItemState {
    fn default() -> Self {
        ItemState::initial()
    }
}

impl ItemState {
    /// State of a freshly ingested item
    pub fn initial() -> Self {
        ItemState::Pending {
            stage: ItemStage::Triage,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            ItemState::Pending { .. } => "pending",
            ItemState::InProgress { .. } => "in_progress",
            ItemState::Failed { .. } => "failed",
            ItemState::Skipped { .. } => "skipped",
            ItemState::Complete => "complete",
        }
    }

    /// Short label such as `pending(lexicon)`
    pub fn label(&self) -> String {
        match self.stage() {
            Some(stage) => format!("{}({})", self.state_name(), stage),
            None => self.state_name().to_string(),
        }
    }

    /// Stage the item currently sits at (`None` once complete)
    pub fn stage(&self) -> Option<ItemStage> {
        match self {
            ItemState::Pending { stage }
            | ItemState::InProgress { stage }
            | ItemState::Failed { stage, .. }
            | ItemState::Skipped { stage, .. } => Some(*stage),
            ItemState::Complete => None,
        }
    }

    /// Derived status of `stage`
    pub fn status(&self, stage: ItemStage) -> StageStatus {
        let current = match self.stage() {
            Some(current) => current,
            None => return StageStatus::Succeeded,
        };

        if stage < current {
            return StageStatus::Succeeded;
        }
        if stage > current {
            return StageStatus::Pending;
        }

        match self {
            ItemState::Pending { .. } => StageStatus::Pending,
            ItemState::InProgress { .. } => StageStatus::InProgress,
            ItemState::Failed { .. } => StageStatus::Failed,
            ItemState::Skipped { .. } => StageStatus::Skipped,
            ItemState::Complete => StageStatus::Succeeded,
        }
    }

    /// Selection predicate of the stage runner
    pub fn is_eligible_for(&self, stage: ItemStage) -> bool {
        matches!(self, ItemState::Pending { stage: s } if *s == stage)
    }

    /// Claimed at `stage`
    pub fn is_in_progress_at(&self, stage: ItemStage) -> bool {
        matches!(self, ItemState::InProgress { stage: s } if *s == stage)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Failed { .. } | ItemState::Skipped { .. } | ItemState::Complete
        )
    }

    /// Pending(s) → InProgress(s)
    pub fn claim(&self, stage: ItemStage) -> Result<ItemState> {
        if self.is_eligible_for(stage) {
            Ok(ItemState::InProgress { stage })
        } else {
            Err(StorageError::invalid_transition(
                self.label(),
                format!("in_progress({})", stage),
            ))
        }
    }

    /// InProgress(s) → Pending(s), used when a claimed item must be retried later
    pub fn release(&self) -> Result<ItemState> {
        match self {
            ItemState::InProgress { stage } => Ok(ItemState::Pending { stage: *stage }),
            _ => Err(StorageError::invalid_transition(self.label(), "pending")),
        }
    }

    /// InProgress(s) → next state for `result`
    pub fn apply(&self, result: &StageResult) -> Result<ItemState> {
        let stage = match self {
            ItemState::InProgress { stage } => *stage,
            _ => {
                return Err(StorageError::invalid_transition(
                    self.label(),
                    format!("{:?}", result),
                ))
            }
        };

        Ok(match result {
            StageResult::Success => match stage.next() {
                Some(next) => ItemState::Pending { stage: next },
                None => ItemState::Complete,
            },
            StageResult::Failed(reason) => ItemState::Failed {
                stage,
                reason: reason.clone(),
            },
            StageResult::Skipped(reason) => ItemState::Skipped {
                stage,
                reason: reason.clone(),
            },
        })
    }
}

/// One entry of an item's transition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTransition {
    pub stage: ItemStage,
    pub from: ItemState,
    pub to: ItemState,
    /// `None` for claim/release bookkeeping transitions
    pub result: Option<StageResult>,
    /// Why the state was set (error reason, confidence, job id, ...)
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl ItemTransition {
    pub fn new(
        stage: ItemStage,
        from: ItemState,
        to: ItemState,
        result: Option<StageResult>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            from,
            to,
            result,
            metadata: serde_json::Value::Null,
            actor: actor.into(),
            at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Claim transition: Pending(stage) → InProgress(stage)
    pub fn claim(from: &ItemState, stage: ItemStage, actor: &str) -> Result<Self> {
        let to = from.claim(stage)?;
        Ok(Self::new(stage, from.clone(), to, None, actor))
    }

    /// Result transition out of InProgress
    pub fn resolve(from: &ItemState, result: StageResult, actor: &str) -> Result<Self> {
        let to = from.apply(&result)?;
        let stage = from
            .stage()
            .ok_or_else(|| StorageError::invalid_transition(from.label(), to.label()))?;
        Ok(Self::new(stage, from.clone(), to, Some(result), actor))
    }

    /// Release transition: InProgress(stage) → Pending(stage)
    pub fn release(from: &ItemState, actor: &str) -> Result<Self> {
        let to = from.release()?;
        let stage = from
            .stage()
            .ok_or_else(|| StorageError::invalid_transition(from.label(), to.label()))?;
        Ok(Self::new(stage, from.clone(), to, None, actor))
    }
}
