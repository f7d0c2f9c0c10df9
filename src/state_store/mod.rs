//! Archival of chunk states.
//!
//! This module provides the [`StateStore`] trait for persisting the
//! terminal [`WorkflowState`] of every chunk, keyed by run id, along with
//! concrete implementations:
//!
//! - [`MemoryStateStore`]: Thread-safe in-memory storage for testing/development
//! - `SqliteStateStore`: SQLite-backed storage (requires the `sqlite` feature)
//!
//! # Example
//!
//! ```
//! use storyreel::{Chunk, MemoryStateStore, StateStore, WorkflowState};
//! use uuid::Uuid;
//!
//! # async fn example() -> storyreel::Result<()> {
//! let store = MemoryStateStore::new();
//! let run_id = Uuid::new_v4();
//!
//! let state = WorkflowState::new(Chunk::new(0, "It was a dark night."));
//! store.save_chunk_state(run_id, &state).await?;
//!
//! let retrieved = store.get_chunk_state(run_id, 0).await?;
//! assert!(retrieved.is_some());
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStateStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{Result, WorkflowState};

/// A trait for persisting and retrieving chunk states.
///
/// Stores are shared by all chunks of a run, so every method takes `&self`
/// and implementations handle their own synchronization.
///
/// # Object Safety
///
/// This trait is object-safe, allowing for dynamic dispatch with
/// `dyn StateStore`. This enables different storage backends (in-memory,
/// SQLite, etc.) to be swapped at runtime.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saves (or replaces) the state of one chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be saved.
    async fn save_chunk_state(&self, run_id: Uuid, state: &WorkflowState) -> Result<()>;

    /// Retrieves the state of one chunk.
    ///
    /// Returns `Ok(None)` if no state was saved for it.
    async fn get_chunk_state(&self, run_id: Uuid, chunk_id: usize)
        -> Result<Option<WorkflowState>>;

    /// Retrieves every chunk state of a run, ordered by `chunk_id`.
    async fn list_chunk_states(&self, run_id: Uuid) -> Result<Vec<WorkflowState>>;

    /// Lists the ids of all runs with saved state.
    async fn list_runs(&self) -> Result<Vec<Uuid>>;

    /// Deletes all state of a run.
    ///
    /// Deleting an unknown run is not an error.
    async fn delete_run(&self, run_id: Uuid) -> Result<()>;
}
