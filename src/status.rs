//! Run status reporting and visualization.
//!
//! This module provides [`RunReport`], the per-chunk outcome of one
//! [`Workflow::run`](crate::Workflow::run) call.

use std::fmt;

use uuid::Uuid;

use crate::{ChunkMerger, ChunkStatus, MergedArtifact, Result, WorkflowState};

/// Returns a status indicator character.
fn status_char(status: ChunkStatus) -> char {
    match status {
        ChunkStatus::Pending => '⏳',
        ChunkStatus::Running => '🔄',
        ChunkStatus::AwaitingReview => '👀',
        ChunkStatus::Revising => '↩',
        ChunkStatus::Completed => '✅',
        ChunkStatus::Failed => '❌',
    }
}

/// Terminal states of every chunk of a run, ordered by `chunk_id`.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier of the run, also used as the archive key.
    pub run_id: Uuid,
    /// Final chunk states in chunk order.
    pub chunks: Vec<WorkflowState>,
}

impl RunReport {
    /// Creates a report, sorting `chunks` by id.
    pub fn new(run_id: Uuid, mut chunks: Vec<WorkflowState>) -> Self {
        chunks.sort_by_key(|c| c.chunk_id);
        Self { run_id, chunks }
    }

    /// Returns true if every chunk completed.
    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(WorkflowState::is_completed)
    }

    /// Returns true if any chunk failed.
    pub fn has_failures(&self) -> bool {
        self.chunks.iter().any(|c| c.status == ChunkStatus::Failed)
    }

    /// Ids of failed chunks.
    pub fn failed_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| c.chunk_id)
            .collect()
    }

    /// Failed chunks with their error descriptions.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| (c.chunk_id, c.error.as_deref().unwrap_or("unknown error")))
            .collect()
    }

    /// Ids of chunks approved by exhausting the revision budget.
    pub fn forced_approvals(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.forced_approval)
            .map(|c| c.chunk_id)
            .collect()
    }

    /// Sum of revision counts over all chunks.
    pub fn total_revisions(&self) -> u32 {
        self.chunks.iter().map(|c| c.revision_count).sum()
    }

    /// Returns the share of completed chunks as a percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.chunks.is_empty() {
            return 100.0;
        }

        let completed = self.chunks.iter().filter(|c| c.is_completed()).count();
        (completed as f32 / self.chunks.len() as f32) * 100.0
    }

    /// Merges the chunk results.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::MergeInconsistency`](crate::ReelError::MergeInconsistency)
    /// naming the failed chunks if the run is not complete.
    pub fn merge(&self, merger: &ChunkMerger) -> Result<MergedArtifact> {
        merger.merge(&self.chunks)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({} chunk(s)):", self.run_id, self.chunks.len())?;
        writeln!(f)?;

        for chunk in &self.chunks {
            let time_str = chunk
                .completed_at
                .or(chunk.started_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "  {} chunk {:<4} {:<15} {}",
                status_char(chunk.status),
                chunk.chunk_id,
                chunk.status,
                time_str
            )?;

            if chunk.revision_count > 0 {
                write!(f, "  (revisions {})", chunk.revision_count)?;
            }
            if chunk.forced_approval {
                write!(f, "  [forced approval]")?;
            }
            if let Some(ref error) = chunk.error {
                write!(f, "  Error: {}", error)?;
            }

            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Progress: {:.0}%", self.progress_percent())?;

        if self.is_complete() {
            writeln!(f, "Status: Complete")?;
        } else if self.has_failures() {
            writeln!(f, "Status: Failed ({} chunk(s))", self.failed_chunks().len())?;
        } else {
            writeln!(f, "Status: In progress")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, ReelError};

    fn completed(id: usize) -> WorkflowState {
        let mut state = WorkflowState::new(Chunk::new(id, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.transition_to(ChunkStatus::AwaitingReview).unwrap();
        state.transition_to(ChunkStatus::Completed).unwrap();
        state
    }

    fn failed(id: usize) -> WorkflowState {
        let mut state = WorkflowState::new(Chunk::new(id, "text"));
        state.transition_to(ChunkStatus::Running).unwrap();
        state.mark_failed(&ReelError::InvalidVerdict("target reviewer".to_string()));
        state
    }

    #[test]
    fn test_report_sorted_by_chunk_id() {
        let report = RunReport::new(Uuid::new_v4(), vec![completed(2), completed(0), completed(1)]);
        let ids: Vec<usize> = report.chunks.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(report.is_complete());
        assert_eq!(report.progress_percent(), 100.0);
    }

    #[test]
    fn test_report_with_failure() {
        let report = RunReport::new(Uuid::new_v4(), vec![completed(0), failed(1), completed(2)]);

        assert!(!report.is_complete());
        assert!(report.has_failures());
        assert_eq!(report.failed_chunks(), vec![1]);
        assert_eq!(report.failures()[0].0, 1);
        assert!(report.failures()[0].1.contains("target reviewer"));
        assert!((report.progress_percent() - 66.67).abs() < 1.0);
    }

    #[test]
    fn test_forced_approvals_and_revisions() {
        let mut forced = completed(1);
        forced.forced_approval = true;
        forced.revision_count = 3;
        let report = RunReport::new(Uuid::new_v4(), vec![completed(0), forced]);

        assert_eq!(report.forced_approvals(), vec![1]);
        assert_eq!(report.total_revisions(), 3);
    }

    #[test]
    fn test_report_display() {
        let mut revised = completed(0);
        revised.revision_count = 1;
        let report = RunReport::new(Uuid::new_v4(), vec![revised, failed(1)]);

        let display = format!("{}", report);
        assert!(display.contains(&report.run_id.to_string()));
        assert!(display.contains("chunk 0"));
        assert!(display.contains("(revisions 1)"));
        assert!(display.contains("Error: Invalid verdict"));
        assert!(display.contains("Status: Failed (1 chunk(s))"));
    }

    #[test]
    fn test_empty_report() {
        let report = RunReport::new(Uuid::new_v4(), Vec::new());
        assert!(report.is_complete());
        assert_eq!(report.progress_percent(), 100.0);
    }
}
