//! Embedding Batch Monitor
//!
//! Drives submitted embedding jobs to a terminal state:
//!
//! | provider status          | action                                        |
//! |--------------------------|-----------------------------------------------|
//! | validating               | poll again after `validating_delay`           |
//! | in_progress / finalizing | poll again, business or off-hours interval    |
//! | completed                | store vectors, items → `Complete`             |
//! | failed / expired         | recover partial output, fallback error ids    |
//! | cancelled                | nothing to recover                            |
//!
//! Items of a settled job that are still unresolved go back to
//! `Pending(Embedding)`. Once every job of a batch is terminal the batch
//! moves to `EmbeddingsCompleted` and the completion notifier fires; if any
//! item is still unembedded it moves to `Failed(embeddings)` instead.

use chrono::Utc;
use dashmap::DashSet;
use kgraph_store::{
    BatchStatus, EmbeddingJobRef, EmbeddingJobStatus, Item, ItemStage, ItemState, ItemStore,
    ItemTransition, LogEntry, LogLevel, QualityWarning, QualityWarningKind, Stage, StageResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::provider::{EmbeddingError, EmbeddingProvider, JobStatusReport};
use super::schedule::{poll_interval, retry_delay};
use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use crate::locks::BatchLocks;
use crate::pipeline::release_item;

const ACTOR: &str = "embedding-monitor";

/// Result of one `check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Poll again after the delay
    Reschedule(Duration),
    /// Job reached a terminal status and was processed
    Settled {
        status: EmbeddingJobStatus,
        embedded: usize,
        fallback: usize,
        released: usize,
    },
    /// Job ref no longer exists
    Gone,
    /// Status polling exhausted its retries; job and batch marked failed
    Abandoned,
}

/// Counts of one fallback run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackReport {
    /// Embedded through `embed_one`
    pub embedded: usize,
    /// Marked embedded from an already stored vector
    pub reused: usize,
    pub failed: usize,
    /// Already complete, unknown, or owned by another stage
    pub skipped: usize,
}

pub struct EmbeddingMonitor {
    store: Arc<dyn ItemStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    locks: BatchLocks,
    notifier: Option<mpsc::UnboundedSender<Uuid>>,
    watching: DashSet<Uuid>,
    shutdown: CancellationToken,
}

impl EmbeddingMonitor {
    pub fn new(
        store: Arc<dyn ItemStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: EmbeddingConfig,
        locks: BatchLocks,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            locks,
            notifier: None,
            watching: DashSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Receive the batch id whenever a batch reaches `EmbeddingsCompleted`
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<Uuid>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Lock registry shared with the controller
    pub fn locks(&self) -> &BatchLocks {
        &self.locks
    }

    /// Stops every watch loop at its next sleep
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_watching(&self, job_id: Uuid) -> bool {
        self.watching.contains(&job_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scheduling
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn a poll loop for `job_id` of `batch_id`. `None` if it is already
    /// watched. A loop that keeps failing fails the job and its batch.
    pub fn watch(self: &Arc<Self>, batch_id: Uuid, job_id: Uuid) -> Option<JoinHandle<()>> {
        if !self.watching.insert(job_id) {
            return None;
        }

        let monitor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut delay = Duration::from_secs(monitor.config.validating_delay_secs);
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => {
                        debug!(job_id = %job_id, "watch cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match monitor.check(job_id).await {
                    Ok(CheckOutcome::Reschedule(next)) => {
                        failures = 0;
                        delay = next;
                    }
                    Ok(outcome) => {
                        debug!(job_id = %job_id, ?outcome, "watch finished");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > monitor.config.max_status_retries {
                            error!(
                                job_id = %job_id,
                                batch_id = %batch_id,
                                error = %e,
                                "giving up on embedding job"
                            );
                            let abandoned = monitor.abandon(batch_id, job_id, failures, &e).await;
                            if let Err(abandon) = abandoned {
                                error!(
                                    job_id = %job_id,
                                    batch_id = %batch_id,
                                    error = %abandon,
                                    "could not record abandoned embedding job"
                                );
                            }
                            break;
                        }
                        warn!(job_id = %job_id, error = %e, attempt = failures, "embedding check failed");
                        delay = retry_delay(&monitor.config, failures);
                    }
                }
            }
            monitor.watching.remove(&job_id);
        }))
    }

    /// Watch every non-terminal job of a batch (startup recovery)
    pub async fn watch_batch(self: &Arc<Self>, batch_id: Uuid) -> Result<usize> {
        let mut started = 0;
        for job in self.store.list_jobs(batch_id).await? {
            if !job.status.is_terminal() && self.watch(batch_id, job.id).is_some() {
                started += 1;
            }
        }
        Ok(started)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Check
    // ═══════════════════════════════════════════════════════════════════════

    /// Poll the provider once and act on the job's status
    pub async fn check(&self, job_id: Uuid) -> Result<CheckOutcome> {
        let mut job = match self.store.get_job(job_id).await? {
            Some(job) => job,
            None => return Ok(CheckOutcome::Gone),
        };

        if job.status.is_terminal() {
            // settled earlier but the batch step did not run yet
            self.complete_batch_if_done(job.batch_id).await?;
            return Ok(CheckOutcome::Settled {
                status: job.status,
                embedded: 0,
                fallback: 0,
                released: 0,
            });
        }

        let report = match self.provider.get_job_status(&job.provider_job_id).await {
            Ok(report) => report,
            Err(e) => return self.on_poll_error(job, e).await,
        };
        job.consecutive_errors = 0;

        debug!(
            job_id = %job.id,
            batch_id = %job.batch_id,
            status = %report.status,
            "embedding job polled"
        );

        match report.status {
            EmbeddingJobStatus::Validating
            | EmbeddingJobStatus::InProgress
            | EmbeddingJobStatus::Finalizing => {
                job.set_status(report.status);
                self.store.save_job(&job).await?;
                let delay = poll_interval(&self.config, report.status, Utc::now())
                    .unwrap_or_else(|| Duration::from_secs(self.config.validating_delay_secs));
                Ok(CheckOutcome::Reschedule(delay))
            }
            EmbeddingJobStatus::Completed
            | EmbeddingJobStatus::Failed
            | EmbeddingJobStatus::Expired => match self.recover(&job, &report).await {
                Ok((embedded, fallback)) => self.settle(job, report.status, embedded, fallback).await,
                Err(PipelineError::Embedding(e)) => self.on_poll_error(job, e).await,
                Err(e) => Err(e),
            },
            EmbeddingJobStatus::Cancelled => {
                warn!(job_id = %job.id, batch_id = %job.batch_id, "embedding job cancelled");
                self.settle(job, EmbeddingJobStatus::Cancelled, 0, FallbackReport::default())
                    .await
            }
        }
    }

    /// Store the output vectors and, for failed/expired jobs, fall back for
    /// the custom ids of the error file
    async fn recover(
        &self,
        job: &EmbeddingJobRef,
        report: &JobStatusReport,
    ) -> Result<(usize, FallbackReport)> {
        let mut embedded = 0;
        if let Some(file_id) = &report.output_file_id {
            let outputs = self.provider.fetch_output(file_id).await?;
            for output in outputs {
                let item = match self.job_item(job, &output.custom_id).await? {
                    Some(item) => item,
                    None => continue,
                };
                if !item.state.is_in_progress_at(ItemStage::Embedding) {
                    continue;
                }
                self.store
                    .store_embedding(&item.content_hash, &output.embedding)
                    .await?;
                if self
                    .resolve(&item, StageResult::Success, serde_json::json!({ "source": "batch", "job_id": job.id }))
                    .await?
                {
                    embedded += 1;
                }
            }
        }

        let mut fallback = FallbackReport::default();
        if report.status != EmbeddingJobStatus::Completed {
            if let Some(file_id) = &report.error_file_id {
                let failures = self.provider.fetch_errors(file_id).await?;
                let ids: Vec<Uuid> = failures
                    .iter()
                    .filter_map(|f| Uuid::parse_str(&f.custom_id).ok())
                    .filter(|id| job.item_ids.contains(id))
                    .collect();
                info!(
                    job_id = %job.id,
                    batch_id = %job.batch_id,
                    items = ids.len(),
                    "running fallback for failed embedding requests"
                );
                let _guard = self.locks.acquire(job.batch_id).await;
                fallback = self.run_fallback(job.batch_id, &ids).await?;
            }
        }

        Ok((embedded, fallback))
    }

    async fn job_item(&self, job: &EmbeddingJobRef, custom_id: &str) -> Result<Option<Item>> {
        let id = match Uuid::parse_str(custom_id) {
            Ok(id) if job.item_ids.contains(&id) => id,
            _ => {
                warn!(job_id = %job.id, custom_id, "output for unknown custom id ignored");
                return Ok(None);
            }
        };
        Ok(self.store.get_item(id).await?)
    }

    async fn settle(
        &self,
        mut job: EmbeddingJobRef,
        status: EmbeddingJobStatus,
        embedded: usize,
        fallback: FallbackReport,
    ) -> Result<CheckOutcome> {
        let released = self.release_unresolved(&job).await?;

        job.set_status(status);
        job.fallback_used |= fallback.embedded > 0;
        self.store.save_job(&job).await?;

        let level = if status == EmbeddingJobStatus::Completed {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.log(
            job.batch_id,
            level,
            format!(
                "embedding job {} {}: {} embedded, {} by fallback, {} released",
                job.provider_job_id, status, embedded, fallback.embedded, released
            ),
        )
        .await?;
        info!(
            job_id = %job.id,
            batch_id = %job.batch_id,
            status = %status,
            embedded,
            fallback = fallback.embedded,
            released,
            "embedding job settled"
        );

        self.complete_batch_if_done(job.batch_id).await?;

        Ok(CheckOutcome::Settled {
            status,
            embedded,
            fallback: fallback.embedded,
            released,
        })
    }

    async fn on_poll_error(
        &self,
        mut job: EmbeddingJobRef,
        cause: EmbeddingError,
    ) -> Result<CheckOutcome> {
        job.consecutive_errors += 1;

        if job.consecutive_errors <= self.config.max_status_retries {
            warn!(
                job_id = %job.id,
                attempt = job.consecutive_errors,
                error = %cause,
                "embedding status poll failed, backing off"
            );
            self.store.save_job(&job).await?;
            return Ok(CheckOutcome::Reschedule(retry_delay(
                &self.config,
                job.consecutive_errors,
            )));
        }

        error!(
            job_id = %job.id,
            batch_id = %job.batch_id,
            error = %cause,
            "embedding status retries exhausted"
        );
        let reason = format!(
            "status polling of job {} failed {} times: {}",
            job.provider_job_id, job.consecutive_errors, cause
        );
        let batch_id = job.batch_id;
        self.fail_job(job).await?;
        self.fail_batch(batch_id, reason).await?;
        Ok(CheckOutcome::Abandoned)
    }

    /// Give up on a job whose checks keep failing outside the provider (the
    /// item store, most likely). The ref is looked up through the batch's
    /// job list when reading it by id is what fails.
    async fn abandon(
        &self,
        batch_id: Uuid,
        job_id: Uuid,
        attempts: u32,
        cause: &PipelineError,
    ) -> Result<()> {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(_) => self
                .store
                .list_jobs(batch_id)
                .await?
                .into_iter()
                .find(|job| job.id == job_id),
        };

        let reason = format!(
            "checks of embedding job {} failed {} times: {}",
            job.as_ref()
                .map(|job| job.provider_job_id.clone())
                .unwrap_or_else(|| job_id.to_string()),
            attempts,
            cause
        );
        if let Some(job) = job {
            self.fail_job(job).await?;
        }
        self.fail_batch(batch_id, reason).await
    }

    /// Release the job's unresolved items and mark it `Failed`
    async fn fail_job(&self, mut job: EmbeddingJobRef) -> Result<usize> {
        let released = self.release_unresolved(&job).await?;
        job.set_status(EmbeddingJobStatus::Failed);
        self.store.save_job(&job).await?;
        Ok(released)
    }

    /// `Failed(embeddings)` unless the batch already moved on
    async fn fail_batch(&self, batch_id: Uuid, reason: String) -> Result<()> {
        {
            let _guard = self.locks.acquire(batch_id).await;
            if let Some(mut batch) = self.store.get_batch(batch_id).await? {
                if batch.status == BatchStatus::GraphAssemblyCompleted {
                    batch.set_status(BatchStatus::Failed {
                        stage: Stage::Embeddings,
                        reason: reason.clone(),
                    });
                    self.store.update_batch(&batch).await?;
                }
            }
        }
        self.log(batch_id, LogLevel::Error, reason).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fallback
    // ═══════════════════════════════════════════════════════════════════════

    /// Embed items one by one through `embed_one`. Items already complete
    /// are left alone; a stored vector for the same content is reused.
    pub async fn run_fallback(&self, batch_id: Uuid, item_ids: &[Uuid]) -> Result<FallbackReport> {
        let mut report = FallbackReport::default();

        for id in item_ids {
            let mut item = match self.store.get_item(*id).await? {
                Some(item) if item.batch_id == batch_id => item,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };

            match &item.state {
                ItemState::InProgress {
                    stage: ItemStage::Embedding,
                } => {}
                ItemState::Pending {
                    stage: ItemStage::Embedding,
                } => {
                    let claim = ItemTransition::claim(&item.state, ItemStage::Embedding, ACTOR)?;
                    let claimed = claim.to.clone();
                    if !self.store.transition_item(item.id, claim, None).await? {
                        report.skipped += 1;
                        continue;
                    }
                    item.state = claimed;
                }
                _ => {
                    report.skipped += 1;
                    continue;
                }
            }

            if self.store.has_embedding(&item.content_hash).await? {
                self.resolve(&item, StageResult::Success, serde_json::json!({ "source": "cache" }))
                    .await?;
                report.reused += 1;
                continue;
            }

            match self.provider.embed_one(&item.content).await {
                Ok(vector) => {
                    self.store.store_embedding(&item.content_hash, &vector).await?;
                    self.resolve(
                        &item,
                        StageResult::Success,
                        serde_json::json!({ "source": "fallback" }),
                    )
                    .await?;
                    report.embedded += 1;
                }
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "fallback embedding failed");
                    let reason = format!("fallback embedding failed: {}", e);
                    self.resolve(
                        &item,
                        StageResult::Failed(reason.clone()),
                        serde_json::json!({ "error": reason }),
                    )
                    .await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch completion
    // ═══════════════════════════════════════════════════════════════════════

    /// Move the batch to `EmbeddingsCompleted` once every job ref is terminal.
    /// Items still waiting for an embedding fail the batch at `Embeddings`
    /// instead, so a resume resubmits them. `true` once completed.
    pub async fn complete_batch_if_done(&self, batch_id: Uuid) -> Result<bool> {
        {
            let _guard = self.locks.acquire(batch_id).await;

            let mut batch = match self.store.get_batch(batch_id).await? {
                Some(batch) => batch,
                None => return Ok(false),
            };
            if batch.status != BatchStatus::GraphAssemblyCompleted {
                return Ok(false);
            }

            let jobs = self.store.list_jobs(batch_id).await?;
            if jobs.iter().any(|job| !job.status.is_terminal()) {
                return Ok(false);
            }

            let unembedded = self
                .store
                .list_items(batch_id)
                .await?
                .iter()
                .filter(|item| item.state.is_eligible_for(ItemStage::Embedding))
                .count();
            if unembedded > 0 {
                let reason = format!(
                    "{} items were not embedded; resume to resubmit them",
                    unembedded
                );
                warn!(batch_id = %batch_id, unembedded, "embedding jobs settled with items left");
                batch.set_status(BatchStatus::Failed {
                    stage: Stage::Embeddings,
                    reason: reason.clone(),
                });
                self.store.update_batch(&batch).await?;
                drop(_guard);
                self.log(batch_id, LogLevel::Warn, reason).await?;
                return Ok(false);
            }

            let fallback_used = jobs.iter().any(|job| job.fallback_used);
            let statuses: BTreeSet<&str> = jobs.iter().map(|job| job.status.as_str()).collect();
            batch.record_stats(
                Stage::Embeddings,
                serde_json::json!({
                    "jobs": jobs.len(),
                    "job_statuses": statuses,
                    "fallback_used": fallback_used,
                }),
            );
            if fallback_used {
                batch.warn(QualityWarning::new(
                    QualityWarningKind::FallbackEmbeddingsUsed,
                    Stage::Embeddings,
                    "some embeddings were produced by the synchronous fallback",
                ));
            }
            batch.set_status(BatchStatus::EmbeddingsCompleted);
            self.store.update_batch(&batch).await?;
            self.store.delete_jobs(batch_id).await?;
        }

        self.log(batch_id, LogLevel::Info, "embeddings completed".to_string())
            .await?;
        info!(batch_id = %batch_id, "batch embeddings completed");

        if let Some(notifier) = &self.notifier {
            if notifier.send(batch_id).is_err() {
                debug!(batch_id = %batch_id, "completion notifier closed");
            }
        }
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    async fn resolve(
        &self,
        item: &Item,
        result: StageResult,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        let transition = ItemTransition::resolve(&item.state, result, ACTOR)?.with_metadata(metadata);
        Ok(self.store.transition_item(item.id, transition, None).await?)
    }

    /// Items of the job still claimed go back to `Pending(Embedding)`
    async fn release_unresolved(&self, job: &EmbeddingJobRef) -> Result<usize> {
        let mut released = 0;
        for id in &job.item_ids {
            if let Some(item) = self.store.get_item(*id).await? {
                if item.state.is_in_progress_at(ItemStage::Embedding)
                    && release_item(self.store.as_ref(), &item, ACTOR).await?
                {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn log(&self, batch_id: Uuid, level: LogLevel, message: String) -> Result<()> {
        self.store
            .append_log(LogEntry::new(
                batch_id,
                level,
                Some(Stage::Embeddings),
                message,
            ))
            .await?;
        Ok(())
    }
}
