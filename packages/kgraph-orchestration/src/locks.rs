//! Per-batch mutual exclusion
//!
//! One async mutex per batch id, created on first use and dropped with
//! `forget` once the batch is finished. The controller holds it for a whole
//! `run`; the embedding monitor takes it for batch-level writes and the
//! synchronous fallback. Different batches never contend.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct BatchLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl BatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, batch_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(batch_id).or_default().value())
    }

    /// Wait for the batch lock
    pub async fn acquire(&self, batch_id: Uuid) -> OwnedMutexGuard<()> {
        self.lock_for(batch_id).lock_owned().await
    }

    /// `None` if another unit of work holds the batch
    pub fn try_acquire(&self, batch_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(batch_id).try_lock_owned().ok()
    }

    pub fn is_held(&self, batch_id: Uuid) -> bool {
        self.locks
            .get(&batch_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Remove the batch's mutex unless a guard or waiter still references
    /// it. `true` if the entry is gone.
    pub fn forget(&self, batch_id: Uuid) -> bool {
        self.locks
            .remove_if(&batch_id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
            || !self.locks.contains_key(&batch_id)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
