//! Shared fixtures for the pipeline integration tests
//!
//! Item content is a small JSON document; the fake extractors read their
//! facts straight out of it, so each test states what extraction "finds".

#![allow(dead_code)]

use async_trait::async_trait;
use kgraph_orchestration::embedding::{EmbeddingFailure, EmbeddingOutput};
use kgraph_orchestration::{
    BatchController, ContentInput, EmbeddingError, EmbeddingMonitor, EmbeddingProvider,
    EmbeddingRequest, EntityExtractor, EntityFact, EntityRef, ExtractionError, ExtractionResult,
    Extractors, JobStatusReport, LexiconExtractor, LexiconTerm, MemoryGraphDriver,
    PipelineConfig, RelationExtractor, RelationFact, RightsExtractor, RightsFacts, RunContext,
};
use kgraph_store::{
    Batch, EmbeddingJobRef, EmbeddingJobStatus, InMemoryItemStore, InsertOutcome, Item,
    ItemStage, ItemState, ItemStore, ItemTransition, LogEntry, RightsRecord, StorageError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Content documents
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Doc {
    pub title: String,
    pub rights: Option<RightsFacts>,
    pub terms: Vec<LexiconTerm>,
    pub entities: Vec<EntityFact>,
    pub relations: Vec<RelationFact>,
}

impl Doc {
    /// Document with rights at confidence 0.9
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
        .rights("archive", 0.9)
    }

    pub fn rights(mut self, contributor: &str, confidence: f64) -> Self {
        self.rights = Some(RightsFacts {
            contributor: contributor.to_string(),
            license: "cc-by".to_string(),
            confidence,
        });
        self
    }

    pub fn without_rights(mut self) -> Self {
        self.rights = None;
        self
    }

    pub fn term(mut self, term: &str) -> Self {
        self.terms.push(LexiconTerm {
            term: term.to_string(),
            definition: format!("definition of {}", term),
        });
        self
    }

    pub fn entity(mut self, pool: &str, name: &str) -> Self {
        self.entities.push(EntityFact {
            pool: pool.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn relation(mut self, source: (&str, &str), verb: &str, target: (&str, &str)) -> Self {
        self.relations.push(RelationFact {
            source: EntityRef::new(source.0, source.1),
            verb: verb.to_string(),
            target: EntityRef::new(target.0, target.1),
        });
        self
    }

    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    pub fn input(&self) -> ContentInput {
        ContentInput::new(format!("{}.json", self.title), self.render())
    }
}

fn parse(content: &str) -> ExtractionResult<Doc> {
    serde_json::from_str(content).map_err(|e| ExtractionError::Malformed(e.to_string()))
}

/// Reads every kind of fact out of a rendered [`Doc`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DocExtractor;

#[async_trait]
impl RightsExtractor for DocExtractor {
    async fn extract(&self, content: &str, _ctx: &RunContext) -> ExtractionResult<RightsFacts> {
        parse(content)?
            .rights
            .ok_or_else(|| ExtractionError::Malformed("no rights statement".into()))
    }
}

#[async_trait]
impl LexiconExtractor for DocExtractor {
    async fn extract(
        &self,
        content: &str,
        _ctx: &RunContext,
    ) -> ExtractionResult<Vec<LexiconTerm>> {
        Ok(parse(content)?.terms)
    }
}

#[async_trait]
impl EntityExtractor for DocExtractor {
    async fn extract(&self, content: &str, _ctx: &RunContext) -> ExtractionResult<Vec<EntityFact>> {
        Ok(parse(content)?.entities)
    }
}

#[async_trait]
impl RelationExtractor for DocExtractor {
    async fn extract(
        &self,
        content: &str,
        _ctx: &RunContext,
    ) -> ExtractionResult<Vec<RelationFact>> {
        Ok(parse(content)?.relations)
    }
}

pub fn extractors() -> Extractors {
    Extractors {
        rights: Arc::new(DocExtractor),
        lexicon: Arc::new(DocExtractor),
        entities: Arc::new(DocExtractor),
        relations: Arc::new(DocExtractor),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Embedding provider
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ProviderState {
    next_job: usize,
    /// Provider job id → submitted requests, in submission order
    submitted: BTreeMap<String, Vec<EmbeddingRequest>>,
    order: Vec<String>,
    statuses: BTreeMap<String, JobStatusReport>,
    files: BTreeMap<String, Vec<EmbeddingOutput>>,
    error_files: BTreeMap<String, Vec<EmbeddingFailure>>,
    /// Jobs complete as soon as they are submitted
    auto_complete: bool,
    failing_submits: usize,
    failing_polls: u32,
    failing_texts: BTreeSet<String>,
    embed_one_calls: usize,
    fetch_calls: usize,
}

/// Scriptable batch embedding API
#[derive(Default)]
pub struct FakeEmbeddingProvider {
    state: Mutex<ProviderState>,
}

pub fn vector_for(text: &str) -> Vec<f32> {
    vec![text.len() as f32, 1.0, 0.5]
}

impl FakeEmbeddingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_completing() -> Self {
        let provider = Self::default();
        provider.state.lock().auto_complete = true;
        provider
    }

    /// Provider job ids in submission order
    pub fn jobs(&self) -> Vec<String> {
        self.state.lock().order.clone()
    }

    pub fn requests(&self, provider_job_id: &str) -> Vec<EmbeddingRequest> {
        self.state
            .lock()
            .submitted
            .get(provider_job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_status(&self, provider_job_id: &str, status: EmbeddingJobStatus) {
        self.state
            .lock()
            .statuses
            .insert(provider_job_id.to_string(), JobStatusReport::new(status));
    }

    /// Every request of the job gets a vector
    pub fn complete(&self, provider_job_id: &str) {
        let mut state = self.state.lock();
        complete_job(&mut state, provider_job_id);
    }

    /// Job ends `status` with vectors for everything except `failed_ids`,
    /// which are listed in the error file
    pub fn finish_partially(
        &self,
        provider_job_id: &str,
        status: EmbeddingJobStatus,
        failed_ids: &[Uuid],
    ) {
        let mut state = self.state.lock();
        let failed: BTreeSet<String> = failed_ids.iter().map(Uuid::to_string).collect();
        let requests = state
            .submitted
            .get(provider_job_id)
            .cloned()
            .unwrap_or_default();

        let outputs = requests
            .iter()
            .filter(|r| !failed.contains(&r.custom_id))
            .map(|r| EmbeddingOutput {
                custom_id: r.custom_id.clone(),
                embedding: vector_for(&r.text),
            })
            .collect();
        let failures = failed
            .iter()
            .map(|id| EmbeddingFailure {
                custom_id: id.clone(),
                message: "input rejected".to_string(),
            })
            .collect();

        let output_file = format!("{}-out", provider_job_id);
        let error_file = format!("{}-err", provider_job_id);
        state.files.insert(output_file.clone(), outputs);
        state.error_files.insert(error_file.clone(), failures);
        state.statuses.insert(
            provider_job_id.to_string(),
            JobStatusReport::new(status)
                .with_output(output_file)
                .with_errors(error_file),
        );
    }

    pub fn fail_next_submits(&self, count: usize) {
        self.state.lock().failing_submits = count;
    }

    pub fn fail_next_polls(&self, count: u32) {
        self.state.lock().failing_polls = count;
    }

    pub fn fail_text(&self, text: &str) {
        self.state.lock().failing_texts.insert(text.to_string());
    }

    pub fn embed_one_calls(&self) -> usize {
        self.state.lock().embed_one_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }
}

fn complete_job(state: &mut ProviderState, provider_job_id: &str) {
    let outputs = state
        .submitted
        .get(provider_job_id)
        .map(|requests| {
            requests
                .iter()
                .map(|r| EmbeddingOutput {
                    custom_id: r.custom_id.clone(),
                    embedding: vector_for(&r.text),
                })
                .collect()
        })
        .unwrap_or_default();
    let output_file = format!("{}-out", provider_job_id);
    state.files.insert(output_file.clone(), outputs);
    state.statuses.insert(
        provider_job_id.to_string(),
        JobStatusReport::new(EmbeddingJobStatus::Completed).with_output(output_file),
    );
}

#[async_trait]
impl EmbeddingProvider for FakeEmbeddingProvider {
    async fn submit_batch(&self, requests: Vec<EmbeddingRequest>) -> Result<String, EmbeddingError> {
        let mut state = self.state.lock();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(EmbeddingError::Unavailable("submit refused".into()));
        }

        state.next_job += 1;
        let id = format!("job-{}", state.next_job);
        state.submitted.insert(id.clone(), requests);
        state.order.push(id.clone());
        state.statuses.insert(
            id.clone(),
            JobStatusReport::new(EmbeddingJobStatus::Validating),
        );
        if state.auto_complete {
            complete_job(&mut state, &id);
        }
        Ok(id)
    }

    async fn get_job_status(&self, provider_job_id: &str) -> Result<JobStatusReport, EmbeddingError> {
        let mut state = self.state.lock();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(EmbeddingError::Unavailable("status endpoint timed out".into()));
        }
        state
            .statuses
            .get(provider_job_id)
            .cloned()
            .ok_or_else(|| EmbeddingError::InvalidResponse(format!("unknown job {}", provider_job_id)))
    }

    async fn fetch_output(&self, file_id: &str) -> Result<Vec<EmbeddingOutput>, EmbeddingError> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        Ok(state.files.get(file_id).cloned().unwrap_or_default())
    }

    async fn fetch_errors(&self, file_id: &str) -> Result<Vec<EmbeddingFailure>, EmbeddingError> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        Ok(state.error_files.get(file_id).cloned().unwrap_or_default())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut state = self.state.lock();
        state.embed_one_calls += 1;
        if state.failing_texts.contains(text) {
            return Err(EmbeddingError::Rejected("text too long".into()));
        }
        Ok(vector_for(text))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════

/// Config whose watch loops never fire during a test; checks are driven
/// by hand through `EmbeddingMonitor::check`
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.embedding.validating_delay_secs = 3600;
    config
}

pub struct Harness {
    pub config: PipelineConfig,
    /// Tables behind `faults`; reads here bypass any injected fault
    pub store: Arc<InMemoryItemStore>,
    /// What the pipeline talks to
    pub faults: Arc<FaultyStore>,
    pub graph: MemoryGraphDriver,
    pub provider: Arc<FakeEmbeddingProvider>,
    pub monitor: Arc<EmbeddingMonitor>,
    pub controller: Arc<BatchController>,
    completions: Option<mpsc::UnboundedReceiver<Uuid>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), FakeEmbeddingProvider::new())
    }

    pub fn build(config: PipelineConfig, provider: FakeEmbeddingProvider) -> Self {
        let store = Arc::new(InMemoryItemStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let graph = MemoryGraphDriver::new();
        let provider = Arc::new(provider);
        let (tx, rx) = mpsc::unbounded_channel();

        let monitor = Arc::new(
            EmbeddingMonitor::new(
                faults.clone(),
                provider.clone(),
                config.embedding.clone(),
                kgraph_orchestration::BatchLocks::new(),
            )
            .with_notifier(tx),
        );
        let controller = Arc::new(BatchController::standard(
            &config,
            faults.clone(),
            extractors(),
            Arc::new(graph.clone()),
            Arc::clone(&monitor),
        ));

        Self {
            config,
            store,
            faults,
            graph,
            provider,
            monitor,
            controller,
            completions: Some(rx),
        }
    }

    /// Create a batch and ingest `docs`
    pub async fn batch(&self, docs: &[Doc]) -> RunContext {
        let batch = self.controller.create_batch("test batch").await.unwrap();
        let ctx = RunContext::new(batch.id, "tester");
        self.controller
            .ingest(&ctx, docs.iter().map(Doc::input).collect())
            .await
            .unwrap();
        ctx
    }

    pub fn take_completions(&mut self) -> mpsc::UnboundedReceiver<Uuid> {
        self.completions.take().expect("completions already taken")
    }

    pub fn try_completion(&mut self) -> Option<Uuid> {
        self.completions.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    pub async fn batch_row(&self, batch_id: Uuid) -> Batch {
        self.store.get_batch(batch_id).await.unwrap().unwrap()
    }

    pub async fn items(&self, batch_id: Uuid) -> Vec<Item> {
        self.store.list_items(batch_id).await.unwrap()
    }

    pub async fn jobs(&self, batch_id: Uuid) -> Vec<EmbeddingJobRef> {
        self.store.list_jobs(batch_id).await.unwrap()
    }

    pub async fn states(&self, batch_id: Uuid) -> Vec<ItemState> {
        self.items(batch_id)
            .await
            .into_iter()
            .map(|item| item.state)
            .collect()
    }
}

pub fn pending(stage: ItemStage) -> ItemState {
    ItemState::Pending { stage }
}

// ═══════════════════════════════════════════════════════════════════════════
// Store wrapper
// ═══════════════════════════════════════════════════════════════════════════

/// Delegating store with faults a test switches on
pub struct FaultyStore {
    inner: Arc<dyn ItemStore>,
    lose_claims: AtomicBool,
    fail_job_reads: AtomicBool,
    held_batch_write: Mutex<Option<BatchWriteHold>>,
}

/// Parks the next `update_batch`: `reached` fires when it arrives, the
/// write goes through after `release`
#[derive(Clone, Default)]
pub struct BatchWriteHold {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ItemStore>) -> Self {
        Self {
            inner,
            lose_claims: AtomicBool::new(false),
            fail_job_reads: AtomicBool::new(false),
            held_batch_write: Mutex::new(None),
        }
    }

    /// Every claim is lost to "another runner"
    pub fn lose_claims(&self) {
        self.lose_claims.store(true, Ordering::SeqCst);
    }

    /// `get_job` fails from now on
    pub fn fail_job_reads(&self) {
        self.fail_job_reads.store(true, Ordering::SeqCst);
    }

    pub fn hold_next_batch_write(&self) -> BatchWriteHold {
        let hold = BatchWriteHold::default();
        *self.held_batch_write.lock() = Some(hold.clone());
        hold
    }
}

#[async_trait]
impl ItemStore for FaultyStore {
    async fn create_batch(&self, batch: &Batch) -> kgraph_store::Result<()> {
        self.inner.create_batch(batch).await
    }

    async fn get_batch(&self, batch_id: Uuid) -> kgraph_store::Result<Option<Batch>> {
        self.inner.get_batch(batch_id).await
    }

    async fn list_batches(&self) -> kgraph_store::Result<Vec<Batch>> {
        self.inner.list_batches().await
    }

    async fn update_batch(&self, batch: &Batch) -> kgraph_store::Result<()> {
        let hold = self.held_batch_write.lock().take();
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        self.inner.update_batch(batch).await
    }

    async fn set_batch_paused(&self, batch_id: Uuid, paused: bool) -> kgraph_store::Result<()> {
        self.inner.set_batch_paused(batch_id, paused).await
    }

    async fn insert_item(&self, item: &Item) -> kgraph_store::Result<InsertOutcome> {
        self.inner.insert_item(item).await
    }

    async fn get_item(&self, item_id: Uuid) -> kgraph_store::Result<Option<Item>> {
        self.inner.get_item(item_id).await
    }

    async fn get_item_by_hash(&self, content_hash: &str) -> kgraph_store::Result<Option<Item>> {
        self.inner.get_item_by_hash(content_hash).await
    }

    async fn list_items(&self, batch_id: Uuid) -> kgraph_store::Result<Vec<Item>> {
        self.inner.list_items(batch_id).await
    }

    async fn transition_item(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
        facts: Option<(ItemStage, serde_json::Value)>,
    ) -> kgraph_store::Result<bool> {
        if self.lose_claims.load(Ordering::SeqCst)
            && matches!(transition.to, ItemState::InProgress { .. })
        {
            return Ok(false);
        }
        self.inner.transition_item(item_id, transition, facts).await
    }

    async fn set_item_rights(&self, item_id: Uuid, rights_id: &str) -> kgraph_store::Result<()> {
        self.inner.set_item_rights(item_id, rights_id).await
    }

    async fn upsert_rights(&self, record: &RightsRecord) -> kgraph_store::Result<()> {
        self.inner.upsert_rights(record).await
    }

    async fn get_rights(&self, rights_id: &str) -> kgraph_store::Result<Option<RightsRecord>> {
        self.inner.get_rights(rights_id).await
    }

    async fn list_rights(&self, batch_id: Uuid) -> kgraph_store::Result<Vec<RightsRecord>> {
        self.inner.list_rights(batch_id).await
    }

    async fn store_embedding(&self, content_hash: &str, vector: &[f32]) -> kgraph_store::Result<()> {
        self.inner.store_embedding(content_hash, vector).await
    }

    async fn get_embedding(&self, content_hash: &str) -> kgraph_store::Result<Option<Vec<f32>>> {
        self.inner.get_embedding(content_hash).await
    }

    async fn save_job(&self, job: &EmbeddingJobRef) -> kgraph_store::Result<()> {
        self.inner.save_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> kgraph_store::Result<Option<EmbeddingJobRef>> {
        if self.fail_job_reads.load(Ordering::SeqCst) {
            return Err(StorageError::database("job table unreadable"));
        }
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self, batch_id: Uuid) -> kgraph_store::Result<Vec<EmbeddingJobRef>> {
        self.inner.list_jobs(batch_id).await
    }

    async fn delete_jobs(&self, batch_id: Uuid) -> kgraph_store::Result<()> {
        self.inner.delete_jobs(batch_id).await
    }

    async fn append_log(&self, entry: LogEntry) -> kgraph_store::Result<()> {
        self.inner.append_log(entry).await
    }

    async fn list_logs(&self, batch_id: Uuid) -> kgraph_store::Result<Vec<LogEntry>> {
        self.inner.list_logs(batch_id).await
    }
}
