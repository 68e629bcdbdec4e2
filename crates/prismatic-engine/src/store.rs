use std::collections::HashMap;
use std::sync::Mutex;

use prismatic_contracts::batch::{Batch, BatchId};

/// Keyed home for batch records. Values are snapshots; callers write back
/// with `put` after mutating.
pub trait BatchStore: Send + Sync {
    fn get(&self, id: &BatchId) -> Option<Batch>;
    fn put(&self, batch: Batch);
    fn delete(&self, id: &BatchId) -> Option<Batch>;
    fn ids(&self) -> Vec<BatchId>;
}

#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: Mutex<HashMap<BatchId, Batch>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BatchId, Batch>> {
        // A panic while holding the map cannot leave a half-written Batch.
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BatchStore for MemoryBatchStore {
    fn get(&self, id: &BatchId) -> Option<Batch> {
        self.lock().get(id).cloned()
    }

    fn put(&self, batch: Batch) {
        self.lock().insert(batch.id.clone(), batch);
    }

    fn delete(&self, id: &BatchId) -> Option<Batch> {
        self.lock().remove(id)
    }

    fn ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
