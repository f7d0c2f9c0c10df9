//! SQLite-backed state store implementation.
//!
//! This module provides [`SqliteStateStore`], a persistent implementation
//! of [`StateStore`] backed by SQLite.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::StateStore;
use crate::{ReelError, Result, WorkflowState};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the chunk_states table.
const CREATE_CHUNK_STATES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS chunk_states (
        run_id TEXT NOT NULL,
        chunk_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        state_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (run_id, chunk_id)
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// Index on chunk_states for querying by status.
const CREATE_STATUS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_chunk_status
    ON chunk_states (status)
"#;

fn join_error(e: tokio::task::JoinError) -> ReelError {
    ReelError::StateStore(format!("spawn_blocking failed: {}", e))
}

fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> ReelError + '_ {
    move |e| ReelError::Database(format!("{}: {}", context, e))
}

fn decode(state_json: &str) -> Result<WorkflowState> {
    serde_json::from_str(state_json)
        .map_err(|e| ReelError::StateStore(format!("failed to deserialize state: {}", e)))
}

/// A SQLite-backed implementation of [`StateStore`].
///
/// This store persists chunk states to a SQLite database, making it
/// suitable for keeping run results across process restarts.
///
/// # Thread Safety
///
/// The store wraps the SQLite connection in a `Mutex` and uses
/// `spawn_blocking` for all database operations, making it safe
/// for use in async contexts.
///
/// # Example
///
/// ```rust,ignore
/// use storyreel::SqliteStateStore;
///
/// // Open or create a database file
/// let store = SqliteStateStore::open("runs.db").await?;
///
/// // Or use an in-memory database for testing
/// let store = SqliteStateStore::open_in_memory().await?;
/// ```
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(join_error)?
            .map_err(db_error("failed to open database"))?;

        Self::with_connection(conn).await
    }

    /// Opens an in-memory SQLite database.
    ///
    /// The database is lost when the store is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(join_error)?
            .map_err(db_error("failed to open in-memory database"))?;

        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Runs schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();

            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_CHUNK_STATES_TABLE, [])?;
                conn.execute(CREATE_STATUS_INDEX, [])?;

                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("migration failed"))
    }

    /// Checks if the required tables exist.
    pub async fn tables_exist(&self) -> Result<bool> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('chunk_states', 'schema_version')",
                [],
                |row| row.get(0),
            )?;
            Ok::<bool, rusqlite::Error>(count == 2)
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("table check failed"))
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_chunk_state(&self, run_id: Uuid, state: &WorkflowState) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let chunk_id = state.chunk_id as i64;
        let status = state.status.to_string();
        let state_json = serde_json::to_string(state)
            .map_err(|e| ReelError::StateStore(format!("failed to serialize state: {}", e)))?;
        let updated_at = chrono::Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO chunk_states (run_id, chunk_id, status, state_json, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id.to_string(), chunk_id, status, state_json, updated_at],
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("insert failed"))
    }

    async fn get_chunk_state(
        &self,
        run_id: Uuid,
        chunk_id: usize,
    ) -> Result<Option<WorkflowState>> {
        let conn = Arc::clone(&self.conn);
        let chunk_id = chunk_id as i64;

        let state_json = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT state_json FROM chunk_states WHERE run_id = ?1 AND chunk_id = ?2",
                params![run_id.to_string(), chunk_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("query failed"))?;

        state_json.as_deref().map(decode).transpose()
    }

    async fn list_chunk_states(&self, run_id: Uuid) -> Result<Vec<WorkflowState>> {
        let conn = Arc::clone(&self.conn);

        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT state_json FROM chunk_states WHERE run_id = ?1 ORDER BY chunk_id",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok::<Vec<String>, rusqlite::Error>(rows)
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("query failed"))?;

        rows.iter().map(|json| decode(json)).collect()
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        let conn = Arc::clone(&self.conn);

        let ids = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT DISTINCT run_id FROM chunk_states")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok::<Vec<String>, rusqlite::Error>(ids)
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("query failed"))?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| ReelError::StateStore(format!("invalid run id {}: {}", id, e)))
            })
            .collect()
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM chunk_states WHERE run_id = ?1",
                params![run_id.to_string()],
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(join_error)?
        .map_err(db_error("delete failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, ChunkStatus, ReviewVerdict, StageId, StageOutput};
    use serde_json::json;

    fn finished(id: usize) -> WorkflowState {
        let mut state = WorkflowState::new(Chunk::new(id, "夜色渐深。"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.record_output(StageId::Writer, StageOutput::new(json!({"scenes": [{"scene_number": 1}]})));
        state.review_history.push(ReviewVerdict::Approve);
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Completed).unwrap();
        state
    }

    #[tokio::test]
    async fn test_open_in_memory_creates_schema() {
        let store = SqliteStateStore::open_in_memory().await.unwrap();
        assert!(store.tables_exist().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let store = SqliteStateStore::open_in_memory().await.unwrap();
        let run = Uuid::new_v4();
        let state = finished(0);

        store.save_chunk_state(run, &state).await.unwrap();
        let retrieved = store.get_chunk_state(run, 0).await.unwrap().unwrap();
        assert_eq!(retrieved, state);
        assert!(store.get_chunk_state(run, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = SqliteStateStore::open_in_memory().await.unwrap();
        let run = Uuid::new_v4();
        for id in [1, 0] {
            store.save_chunk_state(run, &finished(id)).await.unwrap();
        }

        let ids: Vec<usize> = store
            .list_chunk_states(run)
            .await
            .unwrap()
            .iter()
            .map(|s| s.chunk_id)
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(store.list_runs().await.unwrap(), vec![run]);

        store.delete_run(run).await.unwrap();
        assert!(store.list_chunk_states(run).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let run = Uuid::new_v4();

        {
            let store = SqliteStateStore::open(&path).await.unwrap();
            store.save_chunk_state(run, &finished(0)).await.unwrap();
        }

        let reopened = SqliteStateStore::open(&path).await.unwrap();
        assert!(reopened.get_chunk_state(run, 0).await.unwrap().is_some());
    }
}
