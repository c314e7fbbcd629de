//! Batch Controller
//!
//! Sequences the nine pipeline stages for one batch from its recorded status:
//!
//! ```text
//! Created ──ingest──▶ IntakeCompleted ──triage──▶ TriageCompleted ──lexicon──▶ ...
//!   ... ──graph──▶ GraphAssemblyCompleted ──(embedding monitor)──▶ EmbeddingsCompleted
//!   ──scoring──▶ ScoringCompleted ──deliverables──▶ ... ──navigator──▶ NavigatorCompleted
//! ```
//!
//! `run` holds the batch lock for its whole duration and checks the pause
//! flag only between stages. Item stages go through the [`StageRunner`];
//! stages 7-9 call batch-level collaborators directly.

use kgraph_store::{
    Batch, BatchStatus, InsertOutcome, Item, ItemStage, ItemStore, LogEntry, LogLevel,
    QualityWarning, Stage, StageStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    CompletionRatioScorer, DeliverablesCollaborator, EntityExtractor, LexiconExtractor,
    NavigatorCollaborator, RelationExtractor, RightsExtractor, ScoringCollaborator,
};
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::embedding::EmbeddingMonitor;
use crate::error::{PipelineError, Result};
use crate::graph::{GraphAssemblyEngine, GraphDriver};
use crate::locks::BatchLocks;
use crate::pipeline::{release_item, ItemStageHandler};
use crate::runner::StageRunner;
use crate::stages::{EmbeddingStage, GraphStage, LexiconStage, PoolStage, TriageStage};

/// One content unit handed to intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInput {
    pub pointer: String,
    pub content: String,
}

impl ContentInput {
    pub fn new(pointer: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    /// Content already known by hash; nothing written
    pub existing: usize,
}

/// Why `run` stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Paused,
    Failed { stage: Stage, reason: String },
    /// Too many items quarantined; `resume` accepts the review
    NeedsReview,
    /// Embedding jobs outstanding; the monitor finishes the stage
    AwaitingEmbeddings { jobs: usize },
    /// Batch was never ingested
    AwaitingIntake,
    Completed,
}

/// Operator view of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    /// Stage the batch is at: the failed stage, or the next stage to run
    pub stage: Option<Stage>,
    /// Item counts per item stage and rendered stage status
    pub counts: BTreeMap<String, BTreeMap<String, usize>>,
    pub item_total: usize,
    pub literacy_score: Option<f64>,
    pub quality_warnings: Vec<QualityWarning>,
    pub paused: bool,
    pub outstanding_jobs: usize,
}

/// Item-level extraction collaborators
#[derive(Clone)]
pub struct Extractors {
    pub rights: Arc<dyn RightsExtractor>,
    pub lexicon: Arc<dyn LexiconExtractor>,
    pub entities: Arc<dyn EntityExtractor>,
    pub relations: Arc<dyn RelationExtractor>,
}

pub struct BatchController {
    store: Arc<dyn ItemStore>,
    runner: StageRunner,
    handlers: HashMap<ItemStage, Arc<dyn ItemStageHandler>>,
    scoring: Arc<dyn ScoringCollaborator>,
    deliverables: Option<Arc<dyn DeliverablesCollaborator>>,
    navigator: Option<Arc<dyn NavigatorCollaborator>>,
    monitor: Option<Arc<EmbeddingMonitor>>,
    locks: BatchLocks,
}

impl BatchController {
    /// Controller without stage handlers; register them before running
    pub fn new(store: Arc<dyn ItemStore>, locks: BatchLocks) -> Self {
        Self {
            runner: StageRunner::new(Arc::clone(&store)),
            store,
            handlers: HashMap::new(),
            scoring: Arc::new(CompletionRatioScorer),
            deliverables: None,
            navigator: None,
            monitor: None,
            locks,
        }
    }

    /// Controller with the five item stages wired to `extractors`, the graph
    /// driver and the monitor's embedding provider
    pub fn standard(
        config: &PipelineConfig,
        store: Arc<dyn ItemStore>,
        extractors: Extractors,
        graph: Arc<dyn GraphDriver>,
        monitor: Arc<EmbeddingMonitor>,
    ) -> Self {
        let engine = Arc::new(GraphAssemblyEngine::new(graph, config.graph.clone()));
        let mut controller = Self::new(Arc::clone(&store), monitor.locks().clone());

        controller.register_handler(Arc::new(TriageStage::new(
            Arc::clone(&store),
            extractors.rights,
            config.triage.clone(),
        )));
        controller.register_handler(Arc::new(LexiconStage::new(extractors.lexicon)));
        controller.register_handler(Arc::new(PoolStage::new(extractors.entities)));
        controller.register_handler(Arc::new(GraphStage::new(
            Arc::clone(&store),
            extractors.relations,
            engine,
        )));
        controller.register_handler(Arc::new(EmbeddingStage::new(
            store,
            Arc::clone(monitor.provider()),
            config.embedding.clone(),
        )));

        controller.with_monitor(monitor)
    }

    /// Register a stage handler
    pub fn register_handler(&mut self, handler: Arc<dyn ItemStageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringCollaborator>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_deliverables(mut self, deliverables: Arc<dyn DeliverablesCollaborator>) -> Self {
        self.deliverables = Some(deliverables);
        self
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn NavigatorCollaborator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<EmbeddingMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub fn monitor(&self) -> Option<&Arc<EmbeddingMonitor>> {
        self.monitor.as_ref()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Intake (stage 1)
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_batch(&self, name: impl Into<String>) -> Result<Batch> {
        let batch = Batch::new(name);
        self.store.create_batch(&batch).await?;
        info!(batch_id = %batch.id, name = %batch.name, "batch created");
        Ok(batch)
    }

    pub async fn list_batches(&self) -> Result<Vec<Batch>> {
        Ok(self.store.list_batches().await?)
    }

    /// Hash and insert each content; identical content is never inserted twice.
    /// Allowed while the batch is `Created` or `IntakeCompleted`.
    pub async fn ingest(&self, ctx: &RunContext, contents: Vec<ContentInput>) -> Result<IngestReport> {
        let _guard = self
            .locks
            .try_acquire(ctx.batch_id)
            .ok_or(PipelineError::BatchBusy(ctx.batch_id))?;

        let mut batch = self.load_batch(ctx.batch_id).await?;
        if !matches!(
            batch.status,
            BatchStatus::Created | BatchStatus::IntakeCompleted
        ) {
            return Err(PipelineError::transition(
                &batch.status,
                BatchStatus::IntakeCompleted.as_str(),
            ));
        }

        let mut report = IngestReport::default();
        for input in contents {
            let item = Item::new(ctx.batch_id, input.pointer, input.content);
            match self.store.insert_item(&item).await? {
                InsertOutcome::Inserted(_) => report.inserted += 1,
                InsertOutcome::Existing(id) => {
                    debug!(item_id = %id, pointer = %item.content_pointer, "content already ingested");
                    report.existing += 1;
                }
            }
        }

        let total = self.store.list_items(ctx.batch_id).await?.len();
        batch.record_stats(
            Stage::Intake,
            serde_json::json!({
                "inserted": report.inserted,
                "existing": report.existing,
                "total": total,
            }),
        );
        batch.set_status(BatchStatus::IntakeCompleted);
        self.store.update_batch(&batch).await?;
        self.log(
            ctx.batch_id,
            LogLevel::Info,
            Some(Stage::Intake),
            format!(
                "intake: {} inserted, {} already present",
                report.inserted, report.existing
            ),
        )
        .await?;

        info!(
            batch_id = %ctx.batch_id,
            inserted = report.inserted,
            existing = report.existing,
            "intake completed"
        );
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Run / pause / resume
    // ═══════════════════════════════════════════════════════════════════════

    /// Advance the batch as far as it goes. `BatchBusy` if another unit of
    /// work holds the batch.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let guard = self
            .locks
            .try_acquire(ctx.batch_id)
            .ok_or(PipelineError::BatchBusy(ctx.batch_id))?;
        let outcome = self.run_locked(ctx).await;
        drop(guard);
        self.forget_finished(ctx.batch_id, &outcome);
        outcome
    }

    /// A finished batch gives up its lock entry
    fn forget_finished(&self, batch_id: Uuid, outcome: &Result<RunOutcome>) {
        if matches!(outcome, Ok(RunOutcome::Completed)) && self.locks.forget(batch_id) {
            debug!(batch_id = %batch_id, "batch lock released for good");
        }
    }

    async fn run_locked(&self, ctx: &RunContext) -> Result<RunOutcome> {
        loop {
            let batch = self.load_batch(ctx.batch_id).await?;

            if batch.paused {
                info!(batch_id = %ctx.batch_id, status = %batch.status, "batch paused");
                return Ok(RunOutcome::Paused);
            }

            let stage = match &batch.status {
                BatchStatus::Failed { stage, reason } => {
                    return Ok(RunOutcome::Failed {
                        stage: *stage,
                        reason: reason.clone(),
                    })
                }
                BatchStatus::TriageNeedsReview => return Ok(RunOutcome::NeedsReview),
                status => match status.next_stage() {
                    Some(stage) => stage,
                    None => return Ok(RunOutcome::Completed),
                },
            };

            match stage {
                Stage::Intake => return Ok(RunOutcome::AwaitingIntake),
                Stage::Scoring | Stage::Deliverables | Stage::Navigator => {
                    self.run_batch_stage(ctx, batch, stage).await?;
                }
                item_level => {
                    let item_stage = item_level.item_stage().ok_or_else(|| {
                        PipelineError::invariant(format!("{} has no item stage", item_level))
                    })?;
                    let handler = self.handler(item_stage)?;
                    let report = self.runner.advance(ctx, handler.as_ref()).await?;

                    if item_stage == ItemStage::Embedding
                        && report.status == BatchStatus::GraphAssemblyCompleted
                    {
                        let jobs = self.watch_embeddings(ctx.batch_id).await?;
                        info!(batch_id = %ctx.batch_id, jobs, "waiting for embedding jobs");
                        return Ok(RunOutcome::AwaitingEmbeddings { jobs });
                    }
                }
            }
        }
    }

    /// Make sure every outstanding job is watched; returns their number
    async fn watch_embeddings(&self, batch_id: Uuid) -> Result<usize> {
        if let Some(monitor) = &self.monitor {
            let started = monitor.watch_batch(batch_id).await?;
            debug!(batch_id = %batch_id, started, "embedding watches started");
        } else {
            warn!(batch_id = %batch_id, "no embedding monitor; jobs are not polled");
        }
        Ok(self.outstanding_jobs(batch_id).await?.len())
    }

    /// Pause request, honoured at the next stage boundary. Writes only the
    /// flag, so it needs no batch lock and never touches the status.
    pub async fn pause(&self, batch_id: Uuid) -> Result<()> {
        self.store
            .set_batch_paused(batch_id, true)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    PipelineError::BatchNotFound(batch_id)
                } else {
                    PipelineError::Storage(e)
                }
            })?;
        self.log(batch_id, LogLevel::Info, None, "pause requested".to_string())
            .await?;
        info!(batch_id = %batch_id, "pause requested");
        Ok(())
    }

    /// Clear the pause flag, re-enter a failed stage or accept a triage
    /// review, reset stale claims of the re-entered stage, then `run`
    pub async fn resume(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let guard = self
            .locks
            .try_acquire(ctx.batch_id)
            .ok_or(PipelineError::BatchBusy(ctx.batch_id))?;
        let outcome = self.resume_locked(ctx).await;
        drop(guard);
        self.forget_finished(ctx.batch_id, &outcome);
        outcome
    }

    async fn resume_locked(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let mut batch = self.load_batch(ctx.batch_id).await?;
        self.store.set_batch_paused(ctx.batch_id, false).await?;
        batch.paused = false;

        let message = match batch.status.clone() {
            BatchStatus::Failed { stage, reason } => {
                batch.set_status(stage.entry_status());
                format!("resumed at {} after failure: {}", stage, reason)
            }
            BatchStatus::TriageNeedsReview => {
                batch.set_status(BatchStatus::TriageCompleted);
                "triage review accepted; resuming at lexicon".to_string()
            }
            status => format!("resumed from {}", status),
        };
        self.store.update_batch(&batch).await?;
        self.log(ctx.batch_id, LogLevel::Info, None, message).await?;

        if let Some(item_stage) = batch.status.next_stage().and_then(|s| s.item_stage()) {
            self.reset_stale_claims(ctx, item_stage).await?;
        }

        info!(batch_id = %ctx.batch_id, actor = %ctx.actor, status = %batch.status, "batch resumed");
        self.run_locked(ctx).await
    }

    /// Claims left behind by an interrupted run go back to `Pending`. Items
    /// of embedding jobs still running are left to the monitor.
    pub async fn reset_stale_claims(&self, ctx: &RunContext, stage: ItemStage) -> Result<usize> {
        let owned: BTreeSet<Uuid> = if stage == ItemStage::Embedding {
            self.outstanding_jobs(ctx.batch_id)
                .await?
                .into_iter()
                .flat_map(|job| job.item_ids)
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut released = 0;
        for item in self.store.list_items(ctx.batch_id).await? {
            if item.state.is_in_progress_at(stage)
                && !owned.contains(&item.id)
                && release_item(self.store.as_ref(), &item, &ctx.actor).await?
            {
                released += 1;
            }
        }

        if released > 0 {
            warn!(batch_id = %ctx.batch_id, stage = %stage, released, "stale claims released");
            self.log(
                ctx.batch_id,
                LogLevel::Warn,
                Some(Stage::from(stage)),
                format!("{} stale {} claims released", released, stage),
            )
            .await?;
        }
        Ok(released)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch-level stages (7-9)
    // ═══════════════════════════════════════════════════════════════════════

    async fn run_batch_stage(&self, ctx: &RunContext, mut batch: Batch, stage: Stage) -> Result<()> {
        info!(batch_id = %ctx.batch_id, stage = %stage, "stage started");
        let items = self.store.list_items(ctx.batch_id).await?;

        let outcome = match stage {
            Stage::Scoring => self
                .scoring
                .score(&batch, &items, ctx)
                .await
                .map(|raw| {
                    let score = if raw.is_finite() {
                        raw.clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    batch.literacy_score = Some(score);
                    serde_json::json!({ "literacy_score": score, "raw_score": raw })
                }),
            Stage::Deliverables => match &self.deliverables {
                Some(collaborator) => collaborator.produce(&batch, &items, ctx).await,
                None => Ok(serde_json::json!({ "skipped": "no deliverables collaborator" })),
            },
            Stage::Navigator => match &self.navigator {
                Some(collaborator) => collaborator.build(&batch, &items, ctx).await,
                None => Ok(serde_json::json!({ "skipped": "no navigator collaborator" })),
            },
            other => {
                return Err(PipelineError::invariant(format!(
                    "{} is not a batch-level stage",
                    other
                )))
            }
        };

        let stats = match outcome {
            Ok(stats) => stats,
            Err(e) => {
                let reason = format!("{} collaborator failed: {}", stage, e);
                warn!(batch_id = %ctx.batch_id, stage = %stage, error = %e, "stage failed");
                batch.set_status(BatchStatus::Failed {
                    stage,
                    reason: reason.clone(),
                });
                self.store.update_batch(&batch).await?;
                self.log(ctx.batch_id, LogLevel::Error, Some(stage), reason)
                    .await?;
                return Err(PipelineError::Other(e));
            }
        };

        batch.record_stats(stage, stats);
        batch.set_status(BatchStatus::completed(stage));
        self.store.update_batch(&batch).await?;
        self.log(
            ctx.batch_id,
            LogLevel::Info,
            Some(stage),
            format!("{} completed", stage),
        )
        .await?;
        info!(batch_id = %ctx.batch_id, stage = %stage, status = %batch.status, "stage finished");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_batch_status(&self, batch_id: Uuid) -> Result<BatchStatusReport> {
        let batch = self.load_batch(batch_id).await?;
        let items = self.store.list_items(batch_id).await?;
        let outstanding_jobs = self.outstanding_jobs(batch_id).await?.len();

        let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for stage in ItemStage::ALL {
            let per_status = counts.entry(stage.as_str().to_string()).or_default();
            for status in StageStatus::ALL {
                per_status.insert(status.render(stage).to_string(), 0);
            }
            for item in &items {
                *per_status
                    .entry(item.status(stage).render(stage).to_string())
                    .or_default() += 1;
            }
        }

        let stage = match &batch.status {
            BatchStatus::Failed { stage, .. } => Some(*stage),
            BatchStatus::TriageNeedsReview => Some(Stage::Rights),
            BatchStatus::NavigatorCompleted => Some(Stage::Navigator),
            status => status.next_stage(),
        };

        Ok(BatchStatusReport {
            batch_id,
            name: batch.name,
            status: batch.status,
            stage,
            counts,
            item_total: items.len(),
            literacy_score: batch.literacy_score,
            quality_warnings: batch.quality_warnings,
            paused: batch.paused,
            outstanding_jobs,
        })
    }

    pub async fn list_logs(&self, batch_id: Uuid) -> Result<Vec<LogEntry>> {
        self.load_batch(batch_id).await?;
        Ok(self.store.list_logs(batch_id).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn handler(&self, stage: ItemStage) -> Result<Arc<dyn ItemStageHandler>> {
        self.handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::invariant(format!("no handler registered for {}", stage)))
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<Batch> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or(PipelineError::BatchNotFound(batch_id))
    }

    async fn outstanding_jobs(&self, batch_id: Uuid) -> Result<Vec<kgraph_store::EmbeddingJobRef>> {
        Ok(self
            .store
            .list_jobs(batch_id)
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect())
    }

    async fn log(
        &self,
        batch_id: Uuid,
        level: LogLevel,
        stage: Option<Stage>,
        message: String,
    ) -> Result<()> {
        self.store
            .append_log(LogEntry::new(batch_id, level, stage, message))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_store::InMemoryItemStore;
    use pretty_assertions::assert_eq;

    fn controller() -> BatchController {
        BatchController::new(Arc::new(InMemoryItemStore::new()), BatchLocks::new())
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_on_content() {
        let controller = controller();
        let batch = controller.create_batch("intake").await.unwrap();
        let ctx = RunContext::new(batch.id, "test");

        let first = controller
            .ingest(
                &ctx,
                vec![ContentInput::new("a.txt", "alpha"), ContentInput::new("b.txt", "beta")],
            )
            .await
            .unwrap();
        assert_eq!(first, IngestReport { inserted: 2, existing: 0 });

        let second = controller
            .ingest(&ctx, vec![ContentInput::new("a-copy.txt", "alpha")])
            .await
            .unwrap();
        assert_eq!(second, IngestReport { inserted: 0, existing: 1 });

        let report = controller.get_batch_status(batch.id).await.unwrap();
        assert_eq!(report.status, BatchStatus::IntakeCompleted);
        assert_eq!(report.item_total, 2);
        assert_eq!(report.counts["triage"]["pending"], 2);
        assert_eq!(report.stage, Some(Stage::Rights));
    }

    #[tokio::test]
    async fn test_run_before_intake_waits() {
        let controller = controller();
        let batch = controller.create_batch("empty").await.unwrap();
        let outcome = controller
            .run(&RunContext::new(batch.id, "test"))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::AwaitingIntake);
    }

    #[tokio::test]
    async fn test_run_refused_while_batch_is_held() {
        let controller = controller();
        let batch = controller.create_batch("busy").await.unwrap();
        let _guard = controller.locks.try_acquire(batch.id).unwrap();

        let err = controller
            .run(&RunContext::new(batch.id, "test"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BatchBusy(id) if id == batch.id));
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported() {
        let controller = controller();
        let batch = controller.create_batch("no handlers").await.unwrap();
        let ctx = RunContext::new(batch.id, "test");
        controller.ingest(&ctx, vec![ContentInput::new("a", "alpha")]).await.unwrap();

        let err = controller.run(&ctx).await.unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_batch_stages_without_collaborators_are_recorded() {
        let controller = controller();
        let mut batch = controller.create_batch("tail").await.unwrap();
        batch.set_status(BatchStatus::EmbeddingsCompleted);
        controller.store.update_batch(&batch).await.unwrap();

        let outcome = controller
            .run(&RunContext::new(batch.id, "test"))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let batch = controller.store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::NavigatorCompleted);
        // no items: completion ratio scorer returns 0
        assert_eq!(batch.literacy_score, Some(0.0));
        assert_eq!(
            batch.stats["deliverables"]["skipped"],
            "no deliverables collaborator"
        );
    }

    #[tokio::test]
    async fn test_resume_accepts_triage_review() {
        let controller = controller();
        let mut batch = controller.create_batch("review").await.unwrap();
        batch.set_status(BatchStatus::TriageNeedsReview);
        controller.store.update_batch(&batch).await.unwrap();
        let ctx = RunContext::new(batch.id, "operator");

        assert_eq!(controller.run(&ctx).await.unwrap(), RunOutcome::NeedsReview);

        // no lexicon handler registered: resume gets past review, then stops
        let err = controller.resume(&ctx).await.unwrap_err();
        assert!(err.is_invariant_violation());
        let batch = controller.store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::TriageCompleted);
    }

    #[tokio::test]
    async fn test_pause_stops_at_next_boundary() {
        let controller = controller();
        let mut batch = controller.create_batch("paused").await.unwrap();
        batch.set_status(BatchStatus::EmbeddingsCompleted);
        controller.store.update_batch(&batch).await.unwrap();
        controller.pause(batch.id).await.unwrap();
        let ctx = RunContext::new(batch.id, "test");

        assert_eq!(controller.run(&ctx).await.unwrap(), RunOutcome::Paused);
        assert!(controller.get_batch_status(batch.id).await.unwrap().paused);

        assert_eq!(controller.resume(&ctx).await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_completed_batch_drops_its_lock() {
        let controller = controller();
        let mut batch = controller.create_batch("finished").await.unwrap();
        batch.set_status(BatchStatus::EmbeddingsCompleted);
        controller.store.update_batch(&batch).await.unwrap();
        let ctx = RunContext::new(batch.id, "test");

        assert_eq!(controller.run(&ctx).await.unwrap(), RunOutcome::Completed);
        assert!(controller.locks.is_empty());

        // a paused batch keeps its entry
        let other = controller.create_batch("paused").await.unwrap();
        controller.pause(other.id).await.unwrap();
        let ctx = RunContext::new(other.id, "test");
        assert_eq!(controller.run(&ctx).await.unwrap(), RunOutcome::Paused);
        assert_eq!(controller.locks.len(), 1);
    }
}
