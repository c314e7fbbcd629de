// Item stage handlers
pub mod embedding_stage;
pub mod graph_stage;
pub mod lexicon_stage;
pub mod pool_stage;
pub mod triage_stage;

// Re-exports
pub use embedding_stage::EmbeddingStage;
pub use graph_stage::{fallback_rights, GraphStage};
pub use lexicon_stage::LexiconStage;
pub use pool_stage::PoolStage;
pub use triage_stage::TriageStage;
