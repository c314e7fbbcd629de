//! Domain layer for the Item Store
//!
//! # Domain Models
//!
//! - `Batch` / `BatchStatus`: one processing run and its stage-completion state
//! - `Item` / `ItemState`: a content unit and its explicit stage state machine
//! - `RightsRecord`: provenance facts referenced by items and graph entities
//! - `EmbeddingJobRef`: external embedding job owned by the monitor
//! - `LogEntry`: operator log line
//!
//! # Port Trait
//!
//! - `ItemStore`: primary storage abstraction
//!
//! # Examples
//!
//! ```rust,ignore
//! use kgraph_store::{Batch, Item, ItemStore, ItemStage, ItemTransition};
//!
//! async fn example(store: impl ItemStore) -> kgraph_store::Result<()> {
//!     let batch = Batch::new("field-notes");
//!     store.create_batch(&batch).await?;
//!
//!     let item = Item::new(batch.id, "notes/1.md", "A note");
//!     store.insert_item(&item).await?;
//!
//!     // Claim for triage
//!     let claim = ItemTransition::claim(&item.state, ItemStage::Triage, "runner")?;
//!     assert!(store.transition_item(item.id, claim, None).await?);
//!     Ok(())
//! }
//! ```

pub mod models;
pub mod ports;
pub mod state;

pub use models::{
    content_hash, graph_namespace, Batch, BatchStatus, EmbeddingJobRef, EmbeddingJobStatus,
    InsertOutcome, Item, LogEntry, LogLevel, QualityWarning, QualityWarningKind, RightsRecord,
    Stage,
};
pub use ports::ItemStore;
pub use state::{ItemStage, ItemState, ItemTransition, StageResult, StageStatus};
