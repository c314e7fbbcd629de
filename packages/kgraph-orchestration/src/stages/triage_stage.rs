use async_trait::async_trait;
use kgraph_store::{
    BatchStatus, Item, ItemStage, ItemStore, LogLevel, RightsRecord, Stage, StageResult,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::RightsExtractor;
use crate::config::TriageConfig;
use crate::context::RunContext;
use crate::error::Result;
use crate::pipeline::{DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict};

/// Rights triage (stage 2)
///
/// Items whose rights confidence is below the threshold are quarantined
/// (`Skipped`). Everything else gets a rights record with a deterministic id,
/// so re-running triage upserts instead of duplicating.
pub struct TriageStage {
    store: Arc<dyn ItemStore>,
    extractor: Arc<dyn RightsExtractor>,
    config: TriageConfig,
}

impl TriageStage {
    pub fn new(
        store: Arc<dyn ItemStore>,
        extractor: Arc<dyn RightsExtractor>,
        config: TriageConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    /// Batch outcome over the items evaluated in this run
    pub fn outcome(&self, summary: &StageSummary) -> BatchStatus {
        let failed = summary.ratio(summary.failed);
        let quarantined = summary.ratio(summary.skipped);

        if failed > self.config.failed_ratio {
            BatchStatus::Failed {
                stage: Stage::Rights,
                reason: format!(
                    "{} of {} items failed rights triage",
                    summary.failed, summary.processed
                ),
            }
        } else if quarantined > self.config.needs_review_ratio {
            BatchStatus::TriageNeedsReview
        } else {
            BatchStatus::TriageCompleted
        }
    }
}

#[async_trait]
impl ItemStageHandler for TriageStage {
    fn stage(&self) -> ItemStage {
        ItemStage::Triage
    }

    async fn process(&self, ctx: &RunContext, item: &Item) -> Result<ItemOutcome> {
        let facts = match self.extractor.extract(&item.content, ctx).await {
            Ok(facts) => facts,
            Err(e) => return Ok(ItemOutcome::failed(format!("rights extraction failed: {}", e))),
        };

        if !(0.0..=1.0).contains(&facts.confidence) {
            return Ok(ItemOutcome::failed(format!(
                "rights confidence {} outside 0..=1",
                facts.confidence
            )));
        }

        let facts_json = serde_json::to_value(&facts)?;
        if facts.confidence < self.config.confidence_threshold {
            debug!(item_id = %item.id, confidence = facts.confidence, "item quarantined");
            return Ok(ItemOutcome::Resolved {
                result: StageResult::Skipped(format!(
                    "quarantined: rights confidence {:.2} below {:.2}",
                    facts.confidence, self.config.confidence_threshold
                )),
                facts: Some(facts_json),
                metadata: serde_json::json!({ "confidence": facts.confidence }),
            });
        }

        let record = RightsRecord::for_item(item, facts.contributor, facts.license, facts.confidence);
        self.store.upsert_rights(&record).await?;
        self.store.set_item_rights(item.id, &record.id).await?;

        Ok(ItemOutcome::Resolved {
            result: StageResult::Success,
            facts: Some(facts_json),
            metadata: serde_json::json!({ "rights_id": record.id }),
        })
    }

    async fn finish(
        &self,
        _ctx: &RunContext,
        summary: &StageSummary,
        _deferred: &[DeferredItem],
    ) -> Result<StageVerdict> {
        let status = self.outcome(summary);
        let stats = serde_json::json!({
            "failed_ratio": summary.ratio(summary.failed),
            "quarantined_ratio": summary.ratio(summary.skipped),
        });

        let mut verdict = StageVerdict::completed(status.clone()).with_stats(stats);
        if status == BatchStatus::TriageNeedsReview {
            warn!(quarantined = summary.skipped, "triage needs operator review");
            verdict = verdict.log(
                LogLevel::Warn,
                format!(
                    "{} of {} items quarantined; waiting for review",
                    summary.skipped, summary.processed
                ),
            );
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ExtractionResult, RightsFacts};
    use kgraph_store::InMemoryItemStore;

    struct NoRights;

    #[async_trait]
    impl RightsExtractor for NoRights {
        async fn extract(&self, _content: &str, _ctx: &RunContext) -> ExtractionResult<RightsFacts> {
            Ok(RightsFacts {
                contributor: "nobody".into(),
                license: "unknown".into(),
                confidence: 0.0,
            })
        }
    }

    fn stage() -> TriageStage {
        TriageStage::new(
            Arc::new(InMemoryItemStore::new()),
            Arc::new(NoRights),
            TriageConfig::default(),
        )
    }

    fn summary(processed: usize, failed: usize, skipped: usize) -> StageSummary {
        StageSummary {
            selected: processed,
            processed,
            succeeded: processed - failed - skipped,
            failed,
            skipped,
            deferred: 0,
        }
    }

    #[test]
    fn test_outcome_thresholds() {
        let stage = stage();
        assert_eq!(stage.outcome(&summary(5, 0, 2)), BatchStatus::TriageCompleted);
        // exactly at the ratio is not above it
        assert_eq!(stage.outcome(&summary(10, 5, 0)), BatchStatus::TriageCompleted);
        assert!(stage.outcome(&summary(10, 6, 0)).is_failed());
        assert_eq!(stage.outcome(&summary(10, 0, 9)), BatchStatus::TriageNeedsReview);
        assert_eq!(stage.outcome(&summary(0, 0, 0)), BatchStatus::TriageCompleted);
    }

    #[test]
    fn test_failure_wins_over_review() {
        let stage = stage();
        // 6 failed, 4 quarantined: failed ratio checked first
        assert!(stage.outcome(&summary(10, 6, 4)).is_failed());
    }

    #[tokio::test]
    async fn test_low_confidence_is_quarantined() {
        let stage = stage();
        let item = Item::new(uuid::Uuid::new_v4(), "p", "text");
        let ctx = RunContext::new(item.batch_id, "test");
        match stage.process(&ctx, &item).await.unwrap() {
            ItemOutcome::Resolved { result, .. } => {
                assert!(matches!(result, StageResult::Skipped(reason) if reason.starts_with("quarantined")));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
