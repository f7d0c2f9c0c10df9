//! Error types for the storyreel workflow engine.
//!
//! [`ReelError`] covers everything the engine itself can fail with:
//! configuration problems, per-chunk stage failures, illegal review verdicts,
//! merge inconsistencies and cancellation. Errors raised *by* a stage are
//! modelled separately as [`StageError`], because the engine has to tell
//! retryable faults apart from fatal ones before it decides what a stage
//! failure means for the chunk.

use std::time::Duration;

use thiserror::Error;

use crate::{ChunkStatus, StageId};

/// The main error type for storyreel operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReelError {
    /// Invalid setup. Surfaced before any chunk starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage failed and was not (or no longer) eligible for retry.
    #[error("Stage {stage} failed after {attempts} attempt(s): {source}")]
    StageFailure {
        /// The stage that failed.
        stage: StageId,
        /// How many times the stage was invoked before giving up.
        attempts: u32,
        /// The last error the stage reported.
        #[source]
        source: StageError,
    },

    /// The review stage named a target it is not allowed to route to.
    #[error("Invalid verdict: {0}")]
    InvalidVerdict(String),

    /// One or more chunks never reached `completed`, so no artifact exists.
    #[error("Merge inconsistency in chunk(s) {chunk_ids:?}: {detail}")]
    MergeInconsistency {
        /// Offending chunk ids, ascending.
        chunk_ids: Vec<usize>,
        /// What was wrong with them.
        detail: String,
    },

    /// The chunk was cancelled cooperatively.
    #[error("Chunk cancelled")]
    Cancelled,

    /// The chunk state machine was asked to make an illegal move.
    #[error("Chunk {chunk_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The chunk concerned.
        chunk_id: usize,
        /// Status before the attempted move.
        from: ChunkStatus,
        /// Requested status.
        to: ChunkStatus,
    },

    /// A stage referenced by configuration is not registered.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// The same stage was registered twice.
    #[error("Duplicate stage: {0}")]
    DuplicateStage(StageId),

    /// A progress sink could not deliver an event.
    #[error("Progress sink error: {0}")]
    Sink(String),

    /// Error occurred in the state store layer.
    #[error("State store error: {0}")]
    StateStore(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error from file or database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error (for SQLite state store).
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(String),
}

impl ReelError {
    /// Short machine-readable category, used in progress summaries and
    /// archived state.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::ConfigParse(_) => "configuration_error",
            Self::StageFailure { source, .. } if source.is_timeout() => "timeout_error",
            Self::StageFailure { .. } => "stage_failure",
            Self::InvalidVerdict(_) => "invalid_verdict",
            Self::MergeInconsistency { .. } => "merge_inconsistency",
            Self::Cancelled => "cancelled",
            Self::StageNotFound(_) | Self::DuplicateStage(_) => "configuration_error",
            Self::InvalidTransition { .. }
            | Self::Sink(_)
            | Self::StateStore(_)
            | Self::Serialization(_)
            | Self::Io(_) => "internal_error",
            #[cfg(feature = "sqlite")]
            Self::Database(_) => "internal_error",
        }
    }
}

/// A specialized `Result` type for storyreel operations.
pub type Result<T> = std::result::Result<T, ReelError>;

/// Failure reported by a single stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StageError {
    /// Recoverable external fault, such as a backend hiccup or a rate limit.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The stage produced output the pipeline cannot use.
    #[error("malformed output: {0}")]
    Malformed(String),

    /// The invocation exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl StageError {
    /// Returns true if the engine may invoke the stage again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Returns true for the engine-generated timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
