//! Domain models
//!
//! - `Batch`: one processing run over a content collection
//! - `Item`: one content unit of a batch, carrying its stage state
//! - `RightsRecord`: provenance/licensing facts referenced by items
//! - `EmbeddingJobRef`: handle to an external batch embedding job
//! - `LogEntry`: operator-facing batch log line

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::state::{ItemStage, ItemState, ItemTransition, StageStatus};
use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Pipeline stages
// ═══════════════════════════════════════════════════════════════════════════

/// The nine ordered pipeline phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Rights,
    Lexicon,
    Pools,
    Graph,
    Embeddings,
    Scoring,
    Deliverables,
    Navigator,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Intake,
        Stage::Rights,
        Stage::Lexicon,
        Stage::Pools,
        Stage::Graph,
        Stage::Embeddings,
        Stage::Scoring,
        Stage::Deliverables,
        Stage::Navigator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Rights => "rights",
            Stage::Lexicon => "lexicon",
            Stage::Pools => "pools",
            Stage::Graph => "graph",
            Stage::Embeddings => "embeddings",
            Stage::Scoring => "scoring",
            Stage::Deliverables => "deliverables",
            Stage::Navigator => "navigator",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| StorageError::serialization(format!("Invalid stage: {}", s)))
    }

    /// Item-level stage driven by this pipeline stage, if any
    pub fn item_stage(&self) -> Option<ItemStage> {
        match self {
            Stage::Rights => Some(ItemStage::Triage),
            Stage::Lexicon => Some(ItemStage::Lexicon),
            Stage::Pools => Some(ItemStage::Pool),
            Stage::Graph => Some(ItemStage::Graph),
            Stage::Embeddings => Some(ItemStage::Embedding),
            Stage::Intake | Stage::Scoring | Stage::Deliverables | Stage::Navigator => None,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(*self as usize + 1).copied()
    }

    pub fn previous(&self) -> Option<Stage> {
        (*self as usize).checked_sub(1).map(|i| Stage::ALL[i])
    }

    /// Batch status from which a plain run starts this stage
    pub fn entry_status(&self) -> BatchStatus {
        match self.previous() {
            Some(prev) => BatchStatus::completed(prev),
            None => BatchStatus::Created,
        }
    }
}

impl From<ItemStage> for Stage {
    fn from(stage: ItemStage) -> Self {
        match stage {
            ItemStage::Triage => Stage::Rights,
            ItemStage::Lexicon => Stage::Lexicon,
            ItemStage::Pool => Stage::Pools,
            ItemStage::Graph => Stage::Graph,
            ItemStage::Embedding => Stage::Embeddings,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Batch
// ═══════════════════════════════════════════════════════════════════════════

/// Overall batch status: a stage-completion state or the failure state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    IntakeCompleted,
    TriageCompleted,
    TriageNeedsReview,
    LexiconCompleted,
    PoolsCompleted,
    GraphAssemblyCompleted,
    EmbeddingsCompleted,
    ScoringCompleted,
    DeliverablesCompleted,
    NavigatorCompleted,
    Failed { stage: Stage, reason: String },
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::IntakeCompleted => "intake_completed",
            BatchStatus::TriageCompleted => "triage_completed",
            BatchStatus::TriageNeedsReview => "triage_needs_review",
            BatchStatus::LexiconCompleted => "lexicon_completed",
            BatchStatus::PoolsCompleted => "pools_completed",
            BatchStatus::GraphAssemblyCompleted => "graph_assembly_completed",
            BatchStatus::EmbeddingsCompleted => "embeddings_completed",
            BatchStatus::ScoringCompleted => "scoring_completed",
            BatchStatus::DeliverablesCompleted => "deliverables_completed",
            BatchStatus::NavigatorCompleted => "navigator_completed",
            BatchStatus::Failed { .. } => "failed",
        }
    }

    /// Completion state written after `stage` finishes normally
    pub fn completed(stage: Stage) -> Self {
        match stage {
            Stage::Intake => BatchStatus::IntakeCompleted,
            Stage::Rights => BatchStatus::TriageCompleted,
            Stage::Lexicon => BatchStatus::LexiconCompleted,
            Stage::Pools => BatchStatus::PoolsCompleted,
            Stage::Graph => BatchStatus::GraphAssemblyCompleted,
            Stage::Embeddings => BatchStatus::EmbeddingsCompleted,
            Stage::Scoring => BatchStatus::ScoringCompleted,
            Stage::Deliverables => BatchStatus::DeliverablesCompleted,
            Stage::Navigator => BatchStatus::NavigatorCompleted,
        }
    }

    /// Last stage this status records as finished
    pub fn completed_stage(&self) -> Option<Stage> {
        match self {
            BatchStatus::Created | BatchStatus::Failed { .. } => None,
            BatchStatus::IntakeCompleted => Some(Stage::Intake),
            BatchStatus::TriageCompleted | BatchStatus::TriageNeedsReview => Some(Stage::Rights),
            BatchStatus::LexiconCompleted => Some(Stage::Lexicon),
            BatchStatus::PoolsCompleted => Some(Stage::Pools),
            BatchStatus::GraphAssemblyCompleted => Some(Stage::Graph),
            BatchStatus::EmbeddingsCompleted => Some(Stage::Embeddings),
            BatchStatus::ScoringCompleted => Some(Stage::Scoring),
            BatchStatus::DeliverablesCompleted => Some(Stage::Deliverables),
            BatchStatus::NavigatorCompleted => Some(Stage::Navigator),
        }
    }

    /// Stage a plain `run` may start next. `None` when the batch is blocked
    /// (failed, waiting for review) or finished.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            BatchStatus::Created => Some(Stage::Intake),
            BatchStatus::TriageNeedsReview | BatchStatus::Failed { .. } => None,
            other => other.completed_stage().and_then(|s| s.next()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BatchStatus::Failed { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, BatchStatus::NavigatorCompleted)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Failed { stage, reason } => write!(f, "failed({}): {}", stage, reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityWarningKind {
    /// Non-trivial graph without any domain edge
    LowRelationshipDensity,
    /// Some embeddings came from the synchronous fallback path
    FallbackEmbeddingsUsed,
}

/// Non-fatal finding recorded for operator review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWarning {
    pub kind: QualityWarningKind,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl QualityWarning {
    pub fn new(kind: QualityWarningKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One processing run over a content collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    /// Pause request; honoured between stages only
    pub paused: bool,
    /// Aggregate statistics keyed by stage name
    #[serde(default)]
    pub stats: serde_json::Value,
    pub literacy_score: Option<f64>,
    #[serde(default)]
    pub quality_warnings: Vec<QualityWarning>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: BatchStatus::Created,
            paused: false,
            stats: serde_json::json!({}),
            literacy_score: None,
            quality_warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record stage statistics under `stats[stage]`
    pub fn record_stats(&mut self, stage: Stage, stats: serde_json::Value) {
        if !self.stats.is_object() {
            self.stats = serde_json::json!({});
        }
        if let Some(map) = self.stats.as_object_mut() {
            map.insert(stage.as_str().to_string(), stats);
        }
    }

    pub fn warn(&mut self, warning: QualityWarning) {
        self.quality_warnings.push(warning);
    }

    pub fn set_status(&mut self, status: BatchStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Name of the isolated graph namespace of this batch
    pub fn graph_namespace(&self) -> String {
        graph_namespace(self.id)
    }
}

pub fn graph_namespace(batch_id: Uuid) -> String {
    format!("batch_{}", batch_id.simple())
}

// ═══════════════════════════════════════════════════════════════════════════
// Item
// ═══════════════════════════════════════════════════════════════════════════

/// SHA-256 hex digest of content
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// One content unit belonging to exactly one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Unique; used for dedup and idempotent re-ingestion
    pub content_hash: String,
    /// File path or other locator of the source content
    pub content_pointer: String,
    pub content: String,
    pub rights_id: Option<String>,
    pub state: ItemState,
    /// Extraction output keyed by item stage name
    #[serde(default)]
    pub facts: serde_json::Value,
    #[serde(default)]
    pub history: Vec<ItemTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(
        batch_id: Uuid,
        content_pointer: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            content_hash: content_hash(content.as_bytes()),
            content_pointer: content_pointer.into(),
            content,
            rights_id: None,
            state: ItemState::initial(),
            facts: serde_json::json!({}),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self, stage: ItemStage) -> StageStatus {
        self.state.status(stage)
    }

    pub fn facts_for(&self, stage: ItemStage) -> Option<&serde_json::Value> {
        self.facts.get(stage.as_str())
    }

    /// Apply a transition in memory (stores use this for the row they update)
    pub fn apply_transition(
        &mut self,
        transition: ItemTransition,
        facts: Option<(ItemStage, serde_json::Value)>,
    ) {
        self.state = transition.to.clone();
        self.updated_at = transition.at;
        if let Some((stage, value)) = facts {
            if !self.facts.is_object() {
                self.facts = serde_json::json!({});
            }
            if let Some(map) = self.facts.as_object_mut() {
                map.insert(stage.as_str().to_string(), value);
            }
        }
        self.history.push(transition);
    }
}

/// Result of an idempotent item insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// An item with the same content hash exists; nothing written
    Existing(Uuid),
}

impl InsertOutcome {
    pub fn item_id(&self) -> Uuid {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Existing(id) => *id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rights
// ═══════════════════════════════════════════════════════════════════════════

/// Provenance/licensing facts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RightsRecord {
    pub id: String,
    pub batch_id: Uuid,
    pub contributor: String,
    pub license: String,
    pub confidence: f64,
    pub source_item: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RightsRecord {
    /// Record for `item`; the id is derived from the item so re-running triage
    /// upserts the same row.
    pub fn for_item(
        item: &Item,
        contributor: impl Into<String>,
        license: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Self::deterministic_id(item.batch_id, &item.content_hash),
            batch_id: item.batch_id,
            contributor: contributor.into(),
            license: license.into(),
            confidence,
            source_item: Some(item.id),
            created_at: Utc::now(),
        }
    }

    pub fn deterministic_id(batch_id: Uuid, content_hash: &str) -> String {
        let prefix = &content_hash[..content_hash.len().min(16)];
        format!("rights:{}:{}", batch_id.simple(), prefix)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Embedding jobs
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingJobStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl EmbeddingJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingJobStatus::Validating => "validating",
            EmbeddingJobStatus::InProgress => "in_progress",
            EmbeddingJobStatus::Finalizing => "finalizing",
            EmbeddingJobStatus::Completed => "completed",
            EmbeddingJobStatus::Failed => "failed",
            EmbeddingJobStatus::Expired => "expired",
            EmbeddingJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "validating" => Ok(EmbeddingJobStatus::Validating),
            "in_progress" => Ok(EmbeddingJobStatus::InProgress),
            "finalizing" => Ok(EmbeddingJobStatus::Finalizing),
            "completed" => Ok(EmbeddingJobStatus::Completed),
            "failed" => Ok(EmbeddingJobStatus::Failed),
            "expired" => Ok(EmbeddingJobStatus::Expired),
            "cancelled" => Ok(EmbeddingJobStatus::Cancelled),
            _ => Err(StorageError::serialization(format!(
                "Invalid embedding job status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmbeddingJobStatus::Completed
                | EmbeddingJobStatus::Failed
                | EmbeddingJobStatus::Expired
                | EmbeddingJobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for EmbeddingJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle to an externally executing batch embedding job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJobRef {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub provider_job_id: String,
    /// Custom ids (item ids) submitted with the job
    pub item_ids: Vec<Uuid>,
    pub status: EmbeddingJobStatus,
    /// Consecutive failed status polls
    pub consecutive_errors: u32,
    pub fallback_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingJobRef {
    pub fn new(batch_id: Uuid, provider_job_id: impl Into<String>, item_ids: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            provider_job_id: provider_job_id.into(),
            item_ids,
            status: EmbeddingJobStatus::Validating,
            consecutive_errors: 0,
            fallback_used: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: EmbeddingJobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Logs
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(StorageError::serialization(format!(
                "Invalid log level: {}",
                s
            ))),
        }
    }
}

/// Operator-facing log line of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub batch_id: Uuid,
    /// Assigned by the store on append
    pub seq: u64,
    pub level: LogLevel,
    pub stage: Option<Stage>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        batch_id: Uuid,
        level: LogLevel,
        stage: Option<Stage>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            seq: 0,
            level,
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip_and_order() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
        assert_eq!(Stage::Intake.next(), Some(Stage::Rights));
        assert_eq!(Stage::Navigator.next(), None);
        assert_eq!(Stage::Intake.previous(), None);
        assert_eq!(Stage::Graph.previous(), Some(Stage::Pools));
    }

    #[test]
    fn test_entry_status_leads_back_to_stage() {
        for stage in Stage::ALL {
            assert_eq!(stage.entry_status().next_stage(), Some(stage));
        }
    }

    #[test]
    fn test_item_stage_mapping() {
        for item_stage in ItemStage::ALL {
            assert_eq!(Stage::from(item_stage).item_stage(), Some(item_stage));
        }
        assert_eq!(Stage::Scoring.item_stage(), None);
    }

    #[test]
    fn test_batch_status_next_stage() {
        assert_eq!(BatchStatus::Created.next_stage(), Some(Stage::Intake));
        assert_eq!(BatchStatus::TriageCompleted.next_stage(), Some(Stage::Lexicon));
        assert_eq!(
            BatchStatus::GraphAssemblyCompleted.next_stage(),
            Some(Stage::Embeddings)
        );
        assert_eq!(BatchStatus::TriageNeedsReview.next_stage(), None);
        assert_eq!(BatchStatus::NavigatorCompleted.next_stage(), None);
        let failed = BatchStatus::Failed {
            stage: Stage::Graph,
            reason: "driver down".into(),
        };
        assert_eq!(failed.next_stage(), None);
    }

    #[test]
    fn test_completed_status_for_every_stage() {
        for stage in Stage::ALL {
            assert_eq!(BatchStatus::completed(stage).completed_stage(), Some(stage));
        }
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = Item::new(Uuid::new_v4(), "a.md", "hello");
        let b = Item::new(Uuid::new_v4(), "b.md", "hello");
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn test_rights_id_is_deterministic() {
        let item = Item::new(Uuid::new_v4(), "a.md", "hello");
        let r1 = RightsRecord::for_item(&item, "ada", "cc-by", 0.9);
        let r2 = RightsRecord::for_item(&item, "ada", "cc-by", 0.95);
        assert_eq!(r1.id, r2.id);
    }

    #[test]
    fn test_record_stats_overwrites_stage_entry() {
        let mut batch = Batch::new("b");
        batch.record_stats(Stage::Lexicon, serde_json::json!({"processed": 1}));
        batch.record_stats(Stage::Lexicon, serde_json::json!({"processed": 2}));
        assert_eq!(batch.stats["lexicon"]["processed"], 2);
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(!EmbeddingJobStatus::Validating.is_terminal());
        assert!(!EmbeddingJobStatus::Finalizing.is_terminal());
        assert!(EmbeddingJobStatus::Expired.is_terminal());
        assert!(EmbeddingJobStatus::Cancelled.is_terminal());
    }
}
