//! # Storyreel
//!
//! A chunked, revision-aware workflow engine that turns long prose into
//! storyboard scripts.
//!
//! Storyreel splits a text into bounded chunks and drives each chunk
//! through an ordered pipeline of stages (writer, visualizer, sound
//! designer, ...) ending with a reviewer. The reviewer either approves the
//! chunk or sends it back to an earlier stage with feedback; the engine
//! replays the pipeline from that stage until the chunk is approved or its
//! revision budget runs out. Completed chunks are merged into one ordered
//! storyboard artifact.
//!
//! It is designed for pipelines where:
//!
//! - Every stage is an opaque, possibly flaky call (typically an LLM)
//! - Each chunk follows an explicit, inspectable state machine
//! - Review feedback must reach exactly the stage it is addressed to
//! - Chunks may run concurrently but the output keeps the source order
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use storyreel::{PipelineConfig, Workflow};
//!
//! let workflow = Workflow::builder()
//!     .config(PipelineConfig::from_file("storyreel.toml")?)
//!     .stage(Writer::new(client.clone()))
//!     .stage(Visualizer::new(client.clone()))
//!     .stage(SoundDesigner::new(client.clone()))
//!     .stage(Director::new(client))
//!     .build()?;
//!
//! let artifact = workflow.run_to_artifact(&novel_text).await?;
//! println!("{}", artifact.to_json()?);
//! ```
//!
//! ## Chunk lifecycle
//!
//! ```text
//! Pending -> Running -> AwaitingReview -> Completed
//!               ^  ^           |   |
//!               |  +-----------+   v
//!               +-------------- Revising
//! ```
//!
//! `AwaitingReview -> Running` only happens when an optional
//! [`ReviewGate`] approves and hands the chunk on to the reviewer stage.
//! Any non-terminal status can move to `Failed`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod chunker;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod router;
pub mod stage;
pub mod state;
pub mod state_store;
pub mod status;
pub mod workflow;

pub use chunker::{Chunk, ChunkPlan};
pub use config::{PipelineConfig, StagePolicy};
pub use error::{ReelError, Result, StageError};
pub use event::{EventKind, ProgressEvent};
pub use gate::{CallbackGate, ReviewGate};
pub use merge::{ChunkBoundary, ChunkMerger, MergedArtifact, MergedChunk};
pub use pipeline::StageOrder;
pub use progress::{BroadcastSink, CallbackSink, ProgressReporter, ProgressSink, TracingSink};
pub use router::{ReviewVerdict, RevisionRouter, RouteDecision};
pub use stage::{Stage, StageId, StageInput, StageOutput, StageOutputs, StageResult};
pub use state::{ChunkStatus, WorkflowState};
#[cfg(feature = "sqlite")]
pub use state_store::SqliteStateStore;
pub use state_store::{MemoryStateStore, StateStore};
pub use status::RunReport;
pub use tokio_util::sync::CancellationToken;
pub use workflow::{Workflow, WorkflowBuilder};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
