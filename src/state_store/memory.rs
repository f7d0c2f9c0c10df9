//! In-memory state store implementation.
//!
//! This module provides [`MemoryStateStore`], a thread-safe in-memory
//! implementation of [`StateStore`] suitable for testing and development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StateStore;
use crate::{Result, WorkflowState};

/// Chunk states indexed by run id, then chunk id.
type Storage = HashMap<Uuid, BTreeMap<usize, WorkflowState>>;

/// An in-memory implementation of [`StateStore`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it
/// safe to clone and share across async tasks. Multiple readers can access
/// the store concurrently, but writers get exclusive access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    storage: Arc<RwLock<Storage>>,
}

impl MemoryStateStore {
    /// Creates a new, empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of chunk states stored.
    ///
    /// Useful for testing.
    pub async fn chunk_count(&self) -> usize {
        self.storage.read().await.values().map(BTreeMap::len).sum()
    }

    /// Clears all stored data.
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_chunk_state(&self, run_id: Uuid, state: &WorkflowState) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage
            .entry(run_id)
            .or_default()
            .insert(state.chunk_id, state.clone());
        Ok(())
    }

    async fn get_chunk_state(
        &self,
        run_id: Uuid,
        chunk_id: usize,
    ) -> Result<Option<WorkflowState>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(&run_id)
            .and_then(|chunks| chunks.get(&chunk_id))
            .cloned())
    }

    async fn list_chunk_states(&self, run_id: Uuid) -> Result<Vec<WorkflowState>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(&run_id)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        let storage = self.storage.read().await;
        Ok(storage.keys().copied().collect())
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.storage.write().await.remove(&run_id);
        Ok(())
    }
}
