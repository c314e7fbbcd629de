//! kgraph-store - durable Item Store for the ingestion pipeline
//!
//! ## Core Principles
//!
//! 1. **Single source of truth**: batch and item stage state live here and
//!    nowhere else.
//! 2. **One state per item**: an explicit `ItemState` plus a transition log
//!    replaces per-stage status flags; stage ordering is structural.
//! 3. **Row-level writes**: every mutation touches one row; item state changes
//!    are compare-and-set so concurrent runners can claim items safely.
//! 4. **Items are never deleted**: they are created at intake and accumulate
//!    per-stage facts and history.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kgraph_store::{InMemoryItemStore, ItemStore, Batch};
//!
//! let store = InMemoryItemStore::new();
//! let batch = Batch::new("archive-2024");
//! store.create_batch(&batch).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    content_hash, graph_namespace, Batch, BatchStatus, EmbeddingJobRef, EmbeddingJobStatus,
    InsertOutcome, Item, ItemStage, ItemState, ItemStore, ItemTransition, LogEntry, LogLevel,
    QualityWarning, QualityWarningKind, RightsRecord, Stage, StageResult, StageStatus,
};
pub use infrastructure::InMemoryItemStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteItemStore;
