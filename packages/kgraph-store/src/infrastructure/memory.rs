//! In-memory Item Store
//!
//! HashMap-based implementation for unit tests and single-process runs.
//! Not durable.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Batch, EmbeddingJobRef, InsertOutcome, Item, ItemStage, ItemStore, ItemTransition, LogEntry,
    RightsRecord,
};
use crate::error::{Result, StorageError};

#[derive(Default)]
struct Tables {
    batches: HashMap<Uuid, Batch>,
    items: HashMap<Uuid, Item>,
    items_by_hash: HashMap<String, Uuid>,
    /// Insertion order of items
    item_order: Vec<Uuid>,
    rights: HashMap<String, RightsRecord>,
    embeddings: HashMap<String, Vec<f32>>,
    jobs: HashMap<Uuid, EmbeddingJobRef>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
}

#[derive(Clone, Default)]
pub struct InMemoryItemStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        self.tables.write().batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        Ok(self.tables.read().batches.get(&batch_id).cloned())
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self.tables.read().batches.values().cloned().collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches)
    }

    async fn update_batch(&self, batch: &Batch) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.batches.get_mut(&batch.id) {
            Some(row) => {
                let paused = row.paused;
                *row = batch.clone();
                row.paused = paused;
                Ok(())
            }
            None => Err(StorageError::batch_not_found(batch.id)),
        }
    }

    async fn set_batch_paused(&self, batch_id: Uuid, paused: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let row = tables
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| StorageError::batch_not_found(batch_id))?;
        row.paused = paused;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_item(&self, item: &Item) -> Result<InsertOutcome> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.items_by_hash.get(&item.content_hash) {
            return Ok(InsertOutcome::Existing(*existing));
        }
        tables
            .items_by_hash
            .insert(item.content_hash.clone(), item.id);
        tables.items.insert(item.id, item.clone());
        tables.item_order.push(item.id);
        Ok(InsertOutcome::Inserted(item.id))
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        Ok(self.tables.read().items.get(&item_id).cloned())
    }

    async fn get_item_by_hash(&self, content_hash: &str) -> Result<Option<Item>> {
        let tables = self.tables.read();
        Ok(tables
            .items_by_hash
            .get(content_hash)
            .and_then(|id| tables.items.get(id))
            .cloned())
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>> {
        let tables = self.tables.read();
        Ok(tables
            .item_order
            .iter()
            .filter_map(|id| tables.items.get(id))
            .filter(|i| i.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn transition_item(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
        facts: Option<(ItemStage, serde_json::Value)>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or_else(|| StorageError::item_not_found(item_id))?;

        if item.state != transition.from {
            return Ok(false);
        }
        item.apply_transition(transition, facts);
        Ok(true)
    }

    async fn set_item_rights(&self, item_id: Uuid, rights_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or_else(|| StorageError::item_not_found(item_id))?;
        item.rights_id = Some(rights_id.to_string());
        Ok(())
    }

    async fn upsert_rights(&self, record: &RightsRecord) -> Result<()> {
        self.tables
            .write()
            .rights
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_rights(&self, rights_id: &str) -> Result<Option<RightsRecord>> {
        Ok(self.tables.read().rights.get(rights_id).cloned())
    }

    async fn list_rights(&self, batch_id: Uuid) -> Result<Vec<RightsRecord>> {
        let mut records: Vec<RightsRecord> = self
            .tables
            .read()
            .rights
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn store_embedding(&self, content_hash: &str, vector: &[f32]) -> Result<()> {
        self.tables
            .write()
            .embeddings
            .insert(content_hash.to_string(), vector.to_vec());
        Ok(())
    }

    async fn get_embedding(&self, content_hash: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.tables.read().embeddings.get(content_hash).cloned())
    }

    async fn save_job(&self, job: &EmbeddingJobRef) -> Result<()> {
        self.tables.write().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EmbeddingJobRef>> {
        Ok(self.tables.read().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, batch_id: Uuid) -> Result<Vec<EmbeddingJobRef>> {
        let mut jobs: Vec<EmbeddingJobRef> = self
            .tables
            .read()
            .jobs
            .values()
            .filter(|j| j.batch_id == batch_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn delete_jobs(&self, batch_id: Uuid) -> Result<()> {
        self.tables.write().jobs.retain(|_, j| j.batch_id != batch_id);
        Ok(())
    }

    async fn append_log(&self, mut entry: LogEntry) -> Result<()> {
        let mut tables = self.tables.write();
        let logs = tables.logs.entry(entry.batch_id).or_default();
        entry.seq = logs.len() as u64 + 1;
        logs.push(entry);
        Ok(())
    }

    async fn list_logs(&self, batch_id: Uuid) -> Result<Vec<LogEntry>> {
        Ok(self
            .tables
            .read()
            .logs
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchStatus, ItemState, LogLevel, StageResult};

    #[tokio::test]
    async fn test_insert_item_is_idempotent_on_hash() {
        let store = InMemoryItemStore::new();
        let batch = Batch::new("b");
        store.create_batch(&batch).await.unwrap();

        let first = Item::new(batch.id, "a.md", "same body");
        let second = Item::new(batch.id, "b.md", "same body");

        assert_eq!(
            store.insert_item(&first).await.unwrap(),
            InsertOutcome::Inserted(first.id)
        );
        assert_eq!(
            store.insert_item(&second).await.unwrap(),
            InsertOutcome::Existing(first.id)
        );
        assert_eq!(store.list_items(batch.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryItemStore::new();
        let item = Item::new(Uuid::new_v4(), "a.md", "body");
        store.insert_item(&item).await.unwrap();

        let claim = ItemTransition::claim(&item.state, ItemStage::Triage, "t").unwrap();
        assert!(store
            .transition_item(item.id, claim.clone(), None)
            .await
            .unwrap());
        // Second claim from the same expected state loses
        assert!(!store.transition_item(item.id, claim, None).await.unwrap());

        let stored = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(
            stored.state,
            ItemState::InProgress {
                stage: ItemStage::Triage
            }
        );
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_merges_facts() {
        let store = InMemoryItemStore::new();
        let item = Item::new(Uuid::new_v4(), "a.md", "body");
        store.insert_item(&item).await.unwrap();

        let claim = ItemTransition::claim(&item.state, ItemStage::Triage, "t").unwrap();
        let claimed = claim.to.clone();
        store.transition_item(item.id, claim, None).await.unwrap();

        let done = ItemTransition::resolve(&claimed, StageResult::Success, "t").unwrap();
        store
            .transition_item(
                item.id,
                done,
                Some((ItemStage::Triage, serde_json::json!({"contributor": "ada"}))),
            )
            .await
            .unwrap();

        let stored = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(
            stored.facts_for(ItemStage::Triage).unwrap()["contributor"],
            "ada"
        );
    }

    #[tokio::test]
    async fn test_update_unknown_batch_fails() {
        let store = InMemoryItemStore::new();
        let err = store.update_batch(&Batch::new("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_batch_row_keeps_pause_flag() {
        let store = InMemoryItemStore::new();
        let mut batch = Batch::new("b");
        store.create_batch(&batch).await.unwrap();

        store.set_batch_paused(batch.id, true).await.unwrap();
        // written from a copy loaded before the pause
        batch.set_status(BatchStatus::IntakeCompleted);
        store.update_batch(&batch).await.unwrap();

        let stored = store.get_batch(batch.id).await.unwrap().unwrap();
        assert!(stored.paused);
        assert_eq!(stored.status, BatchStatus::IntakeCompleted);

        let err = store
            .set_batch_paused(Uuid::new_v4(), true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_log_sequence_numbers() {
        let store = InMemoryItemStore::new();
        let batch_id = Uuid::new_v4();
        for msg in ["one", "two"] {
            store
                .append_log(LogEntry::new(batch_id, LogLevel::Info, None, msg))
                .await
                .unwrap();
        }
        let logs = store.list_logs(batch_id).await.unwrap();
        assert_eq!(logs.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![1, 2]);
    }
}
