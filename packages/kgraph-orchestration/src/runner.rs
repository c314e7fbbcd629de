//! Stage Runner
//!
//! Advances the items of one batch through one item stage:
//!
//! 1. select `Pending(stage)` items (the only gate, so re-entry is idempotent)
//! 2. claim each with a compare-and-set, in insertion order, one at a time
//! 3. hand it to the stage handler and write the resulting state
//! 4. let the handler decide the batch outcome, then write the batch row once
//!
//! A fatal error (store failure, invariant violation, failed assembly)
//! releases every claimed-but-unresolved item and marks the batch
//! `Failed { stage }`. Item-level progress is never rolled back.

use kgraph_store::{
    BatchStatus, Item, ItemStage, ItemStore, ItemTransition, LogEntry, LogLevel, Stage,
    StageResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::{
    release_item, DeferredDisposition, DeferredItem, ItemOutcome, ItemStageHandler, StageSummary,
    StageVerdict,
};

/// Outcome of one `advance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: ItemStage,
    pub summary: StageSummary,
    /// Batch status after the stage
    pub status: BatchStatus,
    pub warnings: usize,
    /// Embedding jobs submitted by the stage
    pub jobs: Vec<Uuid>,
}

pub struct StageRunner {
    store: Arc<dyn ItemStore>,
}

impl StageRunner {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    pub async fn advance(
        &self,
        ctx: &RunContext,
        handler: &dyn ItemStageHandler,
    ) -> Result<StageReport> {
        let stage = handler.stage();
        let mut summary = StageSummary::default();
        let mut deferred: Vec<DeferredItem> = Vec::new();

        info!(batch_id = %ctx.batch_id, stage = %stage, actor = %ctx.actor, "stage started");

        match self
            .run_stage(ctx, handler, &mut summary, &mut deferred)
            .await
        {
            Ok(verdict) => self.commit_verdict(ctx, stage, summary, verdict).await,
            Err(e) => {
                self.abort(ctx, stage, &deferred, &e).await;
                Err(e)
            }
        }
    }

    async fn run_stage(
        &self,
        ctx: &RunContext,
        handler: &dyn ItemStageHandler,
        summary: &mut StageSummary,
        deferred: &mut Vec<DeferredItem>,
    ) -> Result<StageVerdict> {
        let stage = handler.stage();
        let selected: Vec<Item> = self
            .store
            .list_items(ctx.batch_id)
            .await?
            .into_iter()
            .filter(|item| item.state.is_eligible_for(stage))
            .collect();
        summary.selected = selected.len();
        debug!(batch_id = %ctx.batch_id, stage = %stage, selected = summary.selected, "items selected");

        for mut item in selected {
            let claim = ItemTransition::claim(&item.state, stage, &ctx.actor)?;
            let claimed = claim.to.clone();
            if !self.store.transition_item(item.id, claim, None).await? {
                debug!(item_id = %item.id, stage = %stage, "claim lost, skipping item");
                continue;
            }
            item.state = claimed;
            summary.processed += 1;

            let outcome = match handler.process(ctx, &item).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(release) = release_item(self.store.as_ref(), &item, &ctx.actor).await
                    {
                        warn!(item_id = %item.id, error = %release, "could not release item");
                    }
                    return Err(e);
                }
            };

            match outcome {
                ItemOutcome::Resolved {
                    result,
                    facts,
                    metadata,
                } => {
                    if let StageResult::Failed(reason) = &result {
                        warn!(item_id = %item.id, stage = %stage, reason = %reason, "item failed");
                    }
                    summary.record(&result);
                    self.resolve(ctx, &item, result, facts, metadata).await?;
                }
                ItemOutcome::Deferred { facts, metadata } => {
                    summary.deferred += 1;
                    deferred.push(DeferredItem {
                        item,
                        facts,
                        metadata,
                    });
                }
            }
        }

        if summary.selected > 0 && summary.processed == 0 {
            return Err(PipelineError::invariant(format!(
                "{} items eligible for {} but none was processed",
                summary.selected, stage
            )));
        }

        let verdict = handler.finish(ctx, summary, deferred).await?;

        match &verdict.deferred {
            DeferredDisposition::Resolve(result) => {
                for entry in deferred.drain(..) {
                    summary.deferred -= 1;
                    summary.record(result);
                    self.resolve(ctx, &entry.item, result.clone(), entry.facts, entry.metadata)
                        .await?;
                }
            }
            DeferredDisposition::Release => {
                for entry in deferred.drain(..) {
                    summary.deferred -= 1;
                    release_item(self.store.as_ref(), &entry.item, &ctx.actor).await?;
                }
            }
            DeferredDisposition::Keep => deferred.clear(),
        }

        Ok(verdict)
    }

    async fn resolve(
        &self,
        ctx: &RunContext,
        item: &Item,
        result: StageResult,
        facts: Option<serde_json::Value>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let stage = item
            .state
            .stage()
            .ok_or_else(|| PipelineError::invariant(format!("item {} is not claimed", item.id)))?;
        let transition =
            ItemTransition::resolve(&item.state, result, &ctx.actor)?.with_metadata(metadata);
        let facts = facts.map(|f| (stage, f));
        if !self.store.transition_item(item.id, transition, facts).await? {
            warn!(item_id = %item.id, stage = %stage, "item changed while claimed; result dropped");
        }
        Ok(())
    }

    async fn commit_verdict(
        &self,
        ctx: &RunContext,
        stage: ItemStage,
        summary: StageSummary,
        verdict: StageVerdict,
    ) -> Result<StageReport> {
        let batch_stage = Stage::from(stage);
        let mut batch = self
            .store
            .get_batch(ctx.batch_id)
            .await?
            .ok_or(PipelineError::BatchNotFound(ctx.batch_id))?;

        let mut stats = serde_json::to_value(summary)?;
        if let (Some(map), Some(extra)) = (stats.as_object_mut(), verdict.stats.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        batch.record_stats(batch_stage, stats);

        let warnings = verdict.warnings.len();
        for warning in verdict.warnings {
            batch.warn(warning);
        }
        if let Some(status) = verdict.status {
            batch.set_status(status);
        }
        self.store.update_batch(&batch).await?;

        for (level, message) in verdict.logs {
            self.log(ctx, level, batch_stage, message).await?;
        }
        self.log(
            ctx,
            LogLevel::Info,
            batch_stage,
            format!(
                "{}: selected {}, processed {}, succeeded {}, failed {}, skipped {}, deferred {}",
                stage,
                summary.selected,
                summary.processed,
                summary.succeeded,
                summary.failed,
                summary.skipped,
                summary.deferred
            ),
        )
        .await?;

        info!(
            batch_id = %ctx.batch_id,
            stage = %stage,
            selected = summary.selected,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            status = %batch.status,
            "stage finished"
        );

        Ok(StageReport {
            stage,
            summary,
            status: batch.status,
            warnings,
            jobs: verdict.jobs,
        })
    }

    /// Best effort: the original error is what the caller sees
    async fn abort(
        &self,
        ctx: &RunContext,
        stage: ItemStage,
        deferred: &[DeferredItem],
        cause: &PipelineError,
    ) {
        let batch_stage = Stage::from(stage);
        error!(batch_id = %ctx.batch_id, stage = %stage, error = %cause, "stage aborted");

        for entry in deferred {
            if let Err(e) = release_item(self.store.as_ref(), &entry.item, &ctx.actor).await {
                warn!(item_id = %entry.item.id, error = %e, "could not release item");
            }
        }

        let failed = BatchStatus::Failed {
            stage: batch_stage,
            reason: cause.to_string(),
        };
        match self.store.get_batch(ctx.batch_id).await {
            Ok(Some(mut batch)) => {
                batch.set_status(failed);
                if let Err(e) = self.store.update_batch(&batch).await {
                    warn!(batch_id = %ctx.batch_id, error = %e, "could not mark batch failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(batch_id = %ctx.batch_id, error = %e, "could not load batch"),
        }

        if let Err(e) = self
            .log(
                ctx,
                LogLevel::Error,
                batch_stage,
                format!("{} failed: {}", stage, cause),
            )
            .await
        {
            warn!(batch_id = %ctx.batch_id, error = %e, "could not write batch log");
        }
    }

    async fn log(
        &self,
        ctx: &RunContext,
        level: LogLevel,
        stage: Stage,
        message: String,
    ) -> Result<()> {
        self.store
            .append_log(LogEntry::new(ctx.batch_id, level, Some(stage), message))
            .await?;
        Ok(())
    }
}
