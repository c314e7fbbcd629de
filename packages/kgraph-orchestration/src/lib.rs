/*
 * kgraph Orchestration - ingestion pipeline core
 *
 * Turns a batch of heterogeneous content into a knowledge graph with
 * vector embeddings and a literacy score, through nine ordered stages.
 *
 * Architecture:
 * - Stage Runner (per-item state machine, compare-and-set claims)
 * - Batch Controller (stage sequencing, pause/resume, status queries)
 * - Graph Assembly Engine (schema/data session separation, dedup, orphans)
 * - Embedding Batch Monitor (timer-driven polling, synchronous fallback)
 * - Pipeline Runtime (bounded worker pool, completion re-dispatch)
 */

// Public modules
pub mod collaborators;
pub mod config;
pub mod context;
pub mod controller;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod locks;
pub mod pipeline;
pub mod runner;
pub mod runtime;
pub mod stages;

// Re-exports
pub use collaborators::{
    CompletionRatioScorer, DeliverablesCollaborator, EntityExtractor, EntityFact, EntityRef,
    ExtractionError, ExtractionResult, LexiconExtractor, LexiconTerm, NavigatorCollaborator,
    RelationExtractor, RelationFact, RightsExtractor, RightsFacts, ScoringCollaborator,
};
pub use config::{
    ConfigError, EmbeddingConfig, GraphConfig, PipelineConfig, RuntimeConfig, StoreConfig,
    TriageConfig, CONFIG_ENV,
};
pub use context::RunContext;
pub use controller::{
    BatchController, BatchStatusReport, ContentInput, Extractors, IngestReport, RunOutcome,
};
pub use embedding::{
    CheckOutcome, EmbeddingError, EmbeddingMonitor, EmbeddingProvider, EmbeddingRequest,
    FallbackReport, JobStatusReport,
};
pub use error::{ErrorCategory, PipelineError, Result};
pub use graph::{
    AssemblyInput, AssemblyReport, GraphAssemblyEngine, GraphDriver, GraphError, MemoryGraphDriver,
    NodeLabel, Verb,
};
pub use locks::BatchLocks;
pub use pipeline::{
    DeferredDisposition, DeferredItem, ItemOutcome, ItemStageHandler, StageSummary, StageVerdict,
};
pub use runner::{StageReport, StageRunner};
pub use runtime::PipelineRuntime;
pub use stages::{EmbeddingStage, GraphStage, LexiconStage, PoolStage, TriageStage};
