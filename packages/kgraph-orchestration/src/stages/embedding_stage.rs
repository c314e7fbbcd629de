use async_trait::async_trait;
use kgraph_store::{
    BatchStatus, EmbeddingJobRef, Item, ItemStage, ItemStore, LogLevel, QualityWarning,
    QualityWarningKind, Stage,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::context::RunContext;
use crate::embedding::{EmbeddingProvider, EmbeddingRequest};
use crate::error::Result;
use crate::pipeline::{
    DeferredDisposition, DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict,
};

/// Embedding submission (stage 6)
///
/// Claimed items are submitted in provider jobs of at most
/// `max_batch_size` requests and stay `InProgress(Embedding)`; the
/// embedding monitor resolves them and writes `EmbeddingsCompleted`.
///
/// Every chunk is submitted before any job ref is saved, so a failed
/// submit leaves no ref behind and the runner releases all claimed items.
pub struct EmbeddingStage {
    store: Arc<dyn ItemStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
}

impl EmbeddingStage {
    pub fn new(
        store: Arc<dyn ItemStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Nothing to submit: the batch is done once no job is outstanding
    async fn settle_without_items(&self, batch_id: Uuid) -> Result<StageVerdict> {
        let jobs = self.store.list_jobs(batch_id).await?;
        let outstanding = jobs.iter().filter(|job| !job.status.is_terminal()).count();

        if outstanding > 0 {
            debug!(batch_id = %batch_id, outstanding, "waiting for embedding jobs");
            return Ok(StageVerdict {
                status: None,
                deferred: DeferredDisposition::Keep,
                ..StageVerdict::completed(BatchStatus::GraphAssemblyCompleted)
            }
            .with_stats(serde_json::json!({ "jobs_outstanding": outstanding })));
        }

        let mut verdict = StageVerdict::completed(BatchStatus::EmbeddingsCompleted)
            .with_stats(serde_json::json!({ "jobs_submitted": 0, "items_submitted": 0 }));
        if jobs.iter().any(|job| job.fallback_used) {
            verdict.warnings.push(QualityWarning::new(
                QualityWarningKind::FallbackEmbeddingsUsed,
                Stage::Embeddings,
                "some embeddings were produced by the synchronous fallback",
            ));
        }
        if !jobs.is_empty() {
            self.store.delete_jobs(batch_id).await?;
        }
        Ok(verdict.log(LogLevel::Info, "no items to embed; embeddings completed"))
    }

    fn request(item: &Item) -> EmbeddingRequest {
        EmbeddingRequest {
            custom_id: item.id.to_string(),
            text: item.content.clone(),
        }
    }
}

#[async_trait]
impl ItemStageHandler for EmbeddingStage {
    fn stage(&self) -> ItemStage {
        ItemStage::Embedding
    }

    async fn process(&self, _ctx: &RunContext, _item: &Item) -> Result<ItemOutcome> {
        Ok(ItemOutcome::deferred(None))
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        _summary: &StageSummary,
        deferred: &[DeferredItem],
    ) -> Result<StageVerdict> {
        if deferred.is_empty() {
            return self.settle_without_items(ctx.batch_id).await;
        }

        let mut submitted: Vec<(String, Vec<Uuid>)> = Vec::new();
        for chunk in deferred.chunks(self.config.max_batch_size) {
            let requests: Vec<EmbeddingRequest> =
                chunk.iter().map(|entry| Self::request(&entry.item)).collect();
            let provider_job_id = self.provider.submit_batch(requests).await?;
            debug!(
                batch_id = %ctx.batch_id,
                provider_job_id = %provider_job_id,
                items = chunk.len(),
                "embedding job submitted"
            );
            submitted.push((
                provider_job_id,
                chunk.iter().map(|entry| entry.item.id).collect(),
            ));
        }

        let mut jobs = Vec::with_capacity(submitted.len());
        for (provider_job_id, item_ids) in submitted {
            let job = EmbeddingJobRef::new(ctx.batch_id, provider_job_id, item_ids);
            self.store.save_job(&job).await?;
            jobs.push(job.id);
        }

        info!(
            batch_id = %ctx.batch_id,
            jobs = jobs.len(),
            items = deferred.len(),
            "embedding jobs submitted"
        );

        let mut verdict = StageVerdict::completed(BatchStatus::GraphAssemblyCompleted)
            .with_stats(serde_json::json!({
                "jobs_submitted": jobs.len(),
                "items_submitted": deferred.len(),
            }))
            .log(
                LogLevel::Info,
                format!(
                    "submitted {} items in {} embedding jobs",
                    deferred.len(),
                    jobs.len()
                ),
            );
        verdict.status = None;
        verdict.deferred = DeferredDisposition::Keep;
        verdict.jobs = jobs;
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, EmbeddingFailure, EmbeddingOutput, JobStatusReport};
    use kgraph_store::{Batch, EmbeddingJobStatus, InMemoryItemStore};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        submitted: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        async fn submit_batch(
            &self,
            requests: Vec<EmbeddingRequest>,
        ) -> std::result::Result<String, EmbeddingError> {
            let mut submitted = self.submitted.lock();
            submitted.push(requests.len());
            Ok(format!("job-{}", submitted.len()))
        }

        async fn get_job_status(
            &self,
            _provider_job_id: &str,
        ) -> std::result::Result<JobStatusReport, EmbeddingError> {
            Ok(JobStatusReport::new(EmbeddingJobStatus::InProgress))
        }

        async fn fetch_output(
            &self,
            _file_id: &str,
        ) -> std::result::Result<Vec<EmbeddingOutput>, EmbeddingError> {
            Ok(Vec::new())
        }

        async fn fetch_errors(
            &self,
            _file_id: &str,
        ) -> std::result::Result<Vec<EmbeddingFailure>, EmbeddingError> {
            Ok(Vec::new())
        }

        async fn embed_one(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.0; 4])
        }
    }

    fn deferred(batch_id: Uuid, n: usize) -> Vec<DeferredItem> {
        (0..n)
            .map(|i| DeferredItem {
                item: Item::new(batch_id, format!("p{}", i), format!("content {}", i)),
                facts: None,
                metadata: serde_json::Value::Null,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_items_are_chunked_into_jobs() {
        let store = Arc::new(InMemoryItemStore::new());
        let provider = Arc::new(RecordingProvider::default());
        let config = EmbeddingConfig {
            max_batch_size: 4,
            ..Default::default()
        };
        let stage = EmbeddingStage::new(store.clone(), provider.clone(), config);
        let batch = Batch::new("embed");
        let ctx = RunContext::new(batch.id, "test");

        let verdict = stage
            .finish(&ctx, &StageSummary::default(), &deferred(batch.id, 10))
            .await
            .unwrap();

        assert_eq!(*provider.submitted.lock(), vec![4, 4, 2]);
        assert_eq!(verdict.jobs.len(), 3);
        assert_eq!(verdict.status, None);
        assert_eq!(verdict.deferred, DeferredDisposition::Keep);
        assert_eq!(store.list_jobs(batch.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_items_and_no_jobs_completes() {
        let store = Arc::new(InMemoryItemStore::new());
        let stage = EmbeddingStage::new(
            store,
            Arc::new(RecordingProvider::default()),
            EmbeddingConfig::default(),
        );
        let ctx = RunContext::new(Uuid::new_v4(), "test");

        let verdict = stage
            .finish(&ctx, &StageSummary::default(), &[])
            .await
            .unwrap();
        assert_eq!(verdict.status, Some(BatchStatus::EmbeddingsCompleted));
        assert!(verdict.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_outstanding_jobs_keep_status() {
        let store = Arc::new(InMemoryItemStore::new());
        let batch_id = Uuid::new_v4();
        store
            .save_job(&EmbeddingJobRef::new(batch_id, "job-1", vec![Uuid::new_v4()]))
            .await
            .unwrap();
        let stage = EmbeddingStage::new(
            store,
            Arc::new(RecordingProvider::default()),
            EmbeddingConfig::default(),
        );

        let verdict = stage
            .finish(&RunContext::new(batch_id, "test"), &StageSummary::default(), &[])
            .await
            .unwrap();
        assert_eq!(verdict.status, None);
    }
}
