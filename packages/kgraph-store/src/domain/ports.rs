//! Item Store port (trait interface)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Production/CLI: SQLite (single file)
//! - Testing: InMemory (fast unit tests)

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{Batch, EmbeddingJobRef, InsertOutcome, Item, LogEntry, RightsRecord};
use super::state::{ItemStage, ItemTransition};
use crate::Result;

/// Durable record of batches, items and their stage state.
///
/// Every write is a single-row update. `transition_item` is the only way an
/// item's state changes and doubles as the claim primitive for runners.
#[async_trait]
pub trait ItemStore: Send + Sync {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Batches
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn create_batch(&self, batch: &Batch) -> Result<()>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    async fn list_batches(&self) -> Result<Vec<Batch>>;

    /// Overwrite the batch row except its pause flag. Fails with
    /// `BatchNotFound` for unknown ids.
    async fn update_batch(&self, batch: &Batch) -> Result<()>;

    /// Write the pause flag alone, so a concurrent `update_batch` from a
    /// running stage neither loses it nor is rolled back by it.
    async fn set_batch_paused(&self, batch_id: Uuid, paused: bool) -> Result<()>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Items
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert unless an item with the same content hash exists
    async fn insert_item(&self, item: &Item) -> Result<InsertOutcome>;

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>>;

    async fn get_item_by_hash(&self, content_hash: &str) -> Result<Option<Item>>;

    /// Items of a batch in insertion order
    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>>;

    /// Compare-and-set state change.
    ///
    /// Writes `transition.to` only if the stored state equals
    /// `transition.from`, appends the transition to the item's history and
    /// merges `facts` under the given stage. Returns `false` (nothing written)
    /// when the stored state differs.
    async fn transition_item(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
        facts: Option<(ItemStage, serde_json::Value)>,
    ) -> Result<bool>;

    async fn set_item_rights(&self, item_id: Uuid, rights_id: &str) -> Result<()>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Rights
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert or replace by record id
    async fn upsert_rights(&self, record: &RightsRecord) -> Result<()>;

    async fn get_rights(&self, rights_id: &str) -> Result<Option<RightsRecord>>;

    async fn list_rights(&self, batch_id: Uuid) -> Result<Vec<RightsRecord>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Embeddings (keyed by content hash)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn store_embedding(&self, content_hash: &str, vector: &[f32]) -> Result<()>;

    async fn get_embedding(&self, content_hash: &str) -> Result<Option<Vec<f32>>>;

    async fn has_embedding(&self, content_hash: &str) -> Result<bool> {
        Ok(self.get_embedding(content_hash).await?.is_some())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Embedding job refs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert or replace by job id
    async fn save_job(&self, job: &EmbeddingJobRef) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EmbeddingJobRef>>;

    async fn list_jobs(&self, batch_id: Uuid) -> Result<Vec<EmbeddingJobRef>>;

    async fn delete_jobs(&self, batch_id: Uuid) -> Result<()>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Logs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Append; the store assigns the per-batch sequence number
    async fn append_log(&self, entry: LogEntry) -> Result<()>;

    async fn list_logs(&self, batch_id: Uuid) -> Result<Vec<LogEntry>>;
}
