//! Progress events.
//!
//! This module provides [`ProgressEvent`] for observing chunk execution.
//! Events are handed to every attached [`ProgressSink`](crate::ProgressSink)
//! and can be subscribed to through a broadcast sink for monitoring, logging,
//! or building UIs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChunkStatus, StageId};

/// What happened to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventKind {
    /// The chunk's lifecycle status changed.
    StatusChanged,

    /// A stage has started executing.
    StageStarted,

    /// A stage completed successfully.
    StageCompleted,

    /// A stage failed with a retryable error and will be invoked again.
    StageRetried {
        /// The attempt that is about to start (2 for the first retry).
        attempt: u32,
    },

    /// The chunk is waiting on the human review gate.
    ReviewRequired,

    /// The human review gate approved; the reviewer stage runs next.
    HumanApproved,

    /// The reviewer or the human review gate sent the chunk back.
    RevisionRequested {
        /// Where the chunk re-enters the pipeline.
        target: StageId,
    },

    /// The reviewer approved the chunk.
    Approved,

    /// The chunk was approved because its revision budget ran out.
    ForcedApproval,
}

impl EventKind {
    /// Short snake_case name, matching the serialized tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChanged => "status_changed",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageRetried { .. } => "stage_retried",
            Self::ReviewRequired => "review_required",
            Self::HumanApproved => "human_approved",
            Self::RevisionRequested { .. } => "revision_requested",
            Self::Approved => "approved",
            Self::ForcedApproval => "forced_approval",
        }
    }
}

/// An event emitted during chunk execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The chunk the event is about.
    pub chunk_id: usize,
    /// The chunk's status when the event was emitted.
    pub status: ChunkStatus,
    /// The stage involved, if any.
    pub stage: Option<StageId>,
    /// Optional human-readable detail.
    pub summary: Option<String>,
    /// What happened.
    pub kind: EventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates an event stamped with the current time.
    pub fn new(chunk_id: usize, status: ChunkStatus, kind: EventKind) -> Self {
        Self {
            chunk_id,
            status,
            stage: None,
            summary: None,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Sets the stage.
    pub fn with_stage(mut self, stage: Option<StageId>) -> Self {
        self.stage = stage;
        self
    }

    /// Sets the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Returns true if the event reports a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        self.status == ChunkStatus::Failed
    }

    /// Returns true if this is a completion event.
    pub fn is_completion(&self) -> bool {
        matches!(
            self.kind,
            EventKind::StageCompleted | EventKind::Approved | EventKind::ForcedApproval
        ) || self.status == ChunkStatus::Completed
    }
}
