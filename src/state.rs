//! Per-chunk workflow state.
//!
//! A [`WorkflowState`] is created when a chunk is dispatched, mutated only
//! by the task driving that chunk, and handed back to the caller (and
//! optionally archived) once the chunk is `completed` or `failed`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Chunk, ReelError, Result, ReviewVerdict, StageId, StageInput, StageOrder, StageOutput,
    StageOutputs,
};

/// Lifecycle status of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Created but not yet dispatched.
    Pending,
    /// Stages are executing.
    Running,
    /// A verdict is being obtained or routed, from the human review gate or
    /// from the reviewer stage.
    AwaitingReview,
    /// The chunk was sent back and is about to re-enter the pipeline.
    Revising,
    /// Approved (genuinely or by exhausting the revision budget).
    Completed,
    /// Ended without an approved result.
    Failed,
}

impl ChunkStatus {
    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the state machine allows moving from `self` to
    /// `next`.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, AwaitingReview)
                | (Running, Failed)
                | (AwaitingReview, Running)
                | (AwaitingReview, Revising)
                | (AwaitingReview, Completed)
                | (AwaitingReview, Failed)
                | (Revising, Running)
                | (Revising, Failed)
        )
    }

    /// The snake_case name used in events and persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::Revising => "revising",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one chunk as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Ordinal of the chunk within the source text.
    pub chunk_id: usize,

    /// The chunk's text. Never modified.
    pub source_text: String,

    /// Opening text of the next chunk, if overlap is enabled.
    pub lookahead: Option<String>,

    /// Latest accepted output per stage, in execution order.
    pub stage_outputs: StageOutputs,

    /// Number of times the chunk was routed backwards.
    pub revision_count: u32,

    /// Every verdict the reviewer issued, oldest first.
    pub review_history: Vec<ReviewVerdict>,

    /// Current lifecycle status.
    pub status: ChunkStatus,

    /// The stage currently executing, or the last one that did.
    pub current_stage: Option<StageId>,

    /// Feedback waiting to be delivered, keyed by the stage it addresses.
    pub pending_feedback: BTreeMap<StageId, String>,

    /// Set once the human review gate has been consulted for this chunk.
    #[serde(default)]
    pub human_reviewed: bool,

    /// Set when the chunk was approved because the revision budget ran out.
    pub forced_approval: bool,

    /// Failure description, for `failed` chunks.
    pub error: Option<String>,

    /// Failure category (see [`ReelError::kind`]).
    pub error_kind: Option<String>,

    /// When the chunk was dispatched.
    pub started_at: Option<DateTime<Utc>>,

    /// When the chunk reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Creates the pending state for a freshly dispatched chunk.
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            source_text: chunk.text,
            lookahead: chunk.lookahead,
            stage_outputs: StageOutputs::new(),
            revision_count: 0,
            review_history: Vec::new(),
            status: ChunkStatus::Pending,
            current_stage: None,
            pending_feedback: BTreeMap::new(),
            human_reviewed: false,
            forced_approval: false,
            error: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves to `next`, recording timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::InvalidTransition`] if the state machine does
    /// not allow the move.
    pub fn transition_to(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ReelError::InvalidTransition {
                chunk_id: self.chunk_id,
                from: self.status,
                to: next,
            });
        }
        if next == ChunkStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Marks the chunk failed with `error`.
    ///
    /// A chunk that is already terminal keeps its status; the error is still
    /// recorded if none was.
    pub fn mark_failed(&mut self, error: &ReelError) {
        if self.error.is_none() {
            self.error = Some(error.to_string());
            self.error_kind = Some(error.kind().to_string());
        }
        if !self.status.is_terminal() {
            self.status = ChunkStatus::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Builds the input bundle for `stage` from the current state.
    pub fn stage_input(
        &self,
        stage: StageId,
        order: &StageOrder,
        continuity: Option<&serde_json::Value>,
    ) -> StageInput {
        let prior_outputs = order
            .before(stage)
            .iter()
            .filter_map(|id| self.stage_outputs.get(*id).map(|out| (*id, out.clone())))
            .collect();

        StageInput {
            chunk_id: self.chunk_id,
            source_text: self.source_text.clone(),
            lookahead: self.lookahead.clone(),
            prior_outputs,
            revision: self.revision_count,
            continuity: continuity.cloned(),
        }
    }

    /// Feedback addressed to `stage` by the latest `Revise` verdict, if it
    /// has not been acted on yet.
    pub fn feedback_for(&self, stage: StageId) -> Option<&str> {
        self.pending_feedback.get(&stage).map(String::as_str)
    }

    /// Accepts a successful stage output.
    ///
    /// Pending feedback for that stage is considered delivered.
    pub fn record_output(&mut self, stage: StageId, output: StageOutput) {
        self.stage_outputs.insert(stage, output);
        self.pending_feedback.remove(&stage);
    }

    /// Returns true if the chunk finished with an approved result.
    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order() -> StageOrder {
        StageOrder::new(&[
            StageId::Writer,
            StageId::Visualizer,
            StageId::SoundDesigner,
            StageId::Reviewer,
        ])
        .unwrap()
    }

    #[test]
    fn test_new_state_is_pending() {
        let state = WorkflowState::new(Chunk::new(3, "text"));
        assert_eq!(state.chunk_id, 3);
        assert_eq!(state.status, ChunkStatus::Pending);
        assert_eq!(state.revision_count, 0);
        assert!(state.stage_outputs.is_empty());
        assert!(state.started_at.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        assert!(state.started_at.is_some());
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Revising).unwrap();
        state.transition_to(ChunkStatus::Running).unwrap();
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Completed).unwrap();
        assert!(state.completed_at.is_some());
        assert!(state.is_completed());
    }

    #[test]
    fn test_terminal_states_cannot_be_left() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.transition_to(ChunkStatus::Failed).unwrap();

        let err = state.transition_to(ChunkStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            ReelError::InvalidTransition {
                from: ChunkStatus::Failed,
                to: ChunkStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_human_gate_transitions() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Running).unwrap();
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Completed).unwrap();
        assert!(!ChunkStatus::Revising.can_transition_to(ChunkStatus::AwaitingReview));
    }

    #[test]
    fn test_pending_cannot_skip_to_completed() {
        assert!(!ChunkStatus::Pending.can_transition_to(ChunkStatus::Completed));
        assert!(!ChunkStatus::Running.can_transition_to(ChunkStatus::Completed));
        assert!(!ChunkStatus::Completed.can_transition_to(ChunkStatus::Pending));
    }

    #[test]
    fn test_mark_failed_records_error() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.mark_failed(&ReelError::Cancelled);

        assert_eq!(state.status, ChunkStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Chunk cancelled"));
        assert_eq!(state.error_kind.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_stage_input_only_carries_prior_stages() {
        let mut state = WorkflowState::new(Chunk::new(1, "prose"));
        state.record_output(StageId::Writer, StageOutput::new(json!("w")));
        state.record_output(StageId::Visualizer, StageOutput::new(json!("v")));
        state.record_output(StageId::SoundDesigner, StageOutput::new(json!("s")));

        let input = state.stage_input(StageId::Visualizer, &order(), None);
        assert_eq!(input.chunk_id, 1);
        assert_eq!(input.prior_outputs.len(), 1);
        assert_eq!(input.prior_outputs[0].0, StageId::Writer);

        let continuity = json!({"characters": ["Lin"]});
        let input = state.stage_input(StageId::Reviewer, &order(), Some(&continuity));
        assert_eq!(input.prior_outputs.len(), 3);
        assert_eq!(input.continuity, Some(continuity));
    }

    #[test]
    fn test_feedback_delivered_once() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state
            .pending_feedback
            .insert(StageId::Visualizer, "more light".to_string());
        state
            .pending_feedback
            .insert(StageId::SoundDesigner, "add rain".to_string());

        assert_eq!(state.feedback_for(StageId::Visualizer), Some("more light"));
        assert_eq!(state.feedback_for(StageId::SoundDesigner), Some("add rain"));
        assert_eq!(state.feedback_for(StageId::Writer), None);

        state.record_output(StageId::Writer, StageOutput::new(json!(1)));
        assert_eq!(state.pending_feedback.len(), 2);
        state.record_output(StageId::Visualizer, StageOutput::new(json!(2)));
        assert_eq!(state.feedback_for(StageId::Visualizer), None);
        assert_eq!(state.feedback_for(StageId::SoundDesigner), Some("add rain"));
        state.record_output(StageId::SoundDesigner, StageOutput::new(json!(3)));
        assert!(state.pending_feedback.is_empty());
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        state.record_output(StageId::Writer, StageOutput::new(json!({"scenes": []})));
        state.review_history.push(ReviewVerdict::Approve);

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
