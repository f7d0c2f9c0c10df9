//! Combining per-chunk results into one artifact.
//!
//! The merger only runs once every chunk has completed. It restores chunk
//! order, renumbers scenes into one gap-free sequence spanning all chunks,
//! and records the characters that straddle each chunk boundary so callers
//! can check continuity. It never rewrites content beyond scene numbers.
//!
//! Scene numbers are read from `scenes[].scene_number` in every stage
//! output, as integers or numeric strings. The reviewer's references in
//! `feedbacks[].scene_number` are rewritten through the same mapping. A
//! verdict kept as free text is left as it is.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{ReelError, Result, ReviewVerdict, StageOrder, StageOutputs, WorkflowState};

/// Final result of one chunk inside a [`MergedArtifact`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedChunk {
    /// Ordinal of the chunk.
    pub chunk_id: usize,
    /// The chunk's source text.
    pub source_text: String,
    /// Stage outputs with scene numbers rewritten to global numbering.
    pub outputs: StageOutputs,
    /// Backward routes the chunk went through.
    pub revision_count: u32,
    /// Every verdict issued for the chunk.
    pub review_history: Vec<ReviewVerdict>,
    /// Whether approval was forced by the revision budget.
    pub forced_approval: bool,
    /// First and last global scene number, if the chunk has scenes.
    pub scene_range: Option<(u64, u64)>,
}

/// Continuity record for two adjacent chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkBoundary {
    /// The earlier chunk.
    pub before_chunk: usize,
    /// The later chunk.
    pub after_chunk: usize,
    /// Last global scene of the earlier chunk.
    pub last_scene: Option<u64>,
    /// First global scene of the later chunk.
    pub first_scene: Option<u64>,
    /// Characters appearing in both boundary scenes, sorted.
    pub shared_characters: Vec<String>,
}

/// Ordered combination of all chunk results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedArtifact {
    /// Chunk results, ordered by `chunk_id`.
    pub chunks: Vec<MergedChunk>,
    /// One record per adjacent chunk pair.
    pub boundaries: Vec<ChunkBoundary>,
    /// Number of scenes across all chunks.
    pub total_scenes: u64,
    /// Sum of all chunks' revision counts.
    pub total_revisions: u32,
    /// Chunks that ended through forced approval.
    pub forced_approvals: Vec<usize>,
}

impl MergedArtifact {
    /// Serializes the artifact as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Serialization`] if a payload cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Merges completed chunk states.
#[derive(Debug, Clone)]
pub struct ChunkMerger {
    order: StageOrder,
}

impl ChunkMerger {
    /// Creates a merger that expects an output for every stage in `order`.
    pub fn new(order: StageOrder) -> Self {
        Self { order }
    }

    /// Merges `states`, which may be in any order.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::MergeInconsistency`] listing the offending chunk
    /// ids if the ids are not exactly `0..n`, if a chunk is not completed,
    /// or if a chunk lacks the output of a configured stage.
    pub fn merge(&self, states: &[WorkflowState]) -> Result<MergedArtifact> {
        let mut sorted: Vec<&WorkflowState> = states.iter().collect();
        sorted.sort_by_key(|s| s.chunk_id);
        self.check(&sorted)?;

        let mut next_scene = 1u64;
        let mut chunks = Vec::with_capacity(sorted.len());
        for state in &sorted {
            let (outputs, scene_range) = renumber(&state.stage_outputs, &mut next_scene);
            debug!(chunk_id = state.chunk_id, scenes = ?scene_range, "merged chunk");
            chunks.push(MergedChunk {
                chunk_id: state.chunk_id,
                source_text: state.source_text.clone(),
                outputs,
                revision_count: state.revision_count,
                review_history: state.review_history.clone(),
                forced_approval: state.forced_approval,
                scene_range,
            });
        }

        let boundaries = chunks
            .windows(2)
            .map(|pair| boundary(&pair[0], &pair[1]))
            .collect();

        Ok(MergedArtifact {
            boundaries,
            total_scenes: next_scene - 1,
            total_revisions: chunks.iter().map(|c| c.revision_count).sum(),
            forced_approvals: chunks
                .iter()
                .filter(|c| c.forced_approval)
                .map(|c| c.chunk_id)
                .collect(),
            chunks,
        })
    }

    fn check(&self, sorted: &[&WorkflowState]) -> Result<()> {
        if sorted.is_empty() {
            return Err(ReelError::MergeInconsistency {
                chunk_ids: Vec::new(),
                detail: "no chunk results to merge".to_string(),
            });
        }

        let n = sorted.len();
        let present: BTreeSet<usize> = sorted.iter().map(|s| s.chunk_id).collect();
        let mut misplaced: BTreeSet<usize> = (0..n).filter(|id| !present.contains(id)).collect();
        misplaced.extend(sorted.iter().map(|s| s.chunk_id).filter(|id| *id >= n));
        for pair in sorted.windows(2) {
            if pair[0].chunk_id == pair[1].chunk_id {
                misplaced.insert(pair[0].chunk_id);
            }
        }
        if !misplaced.is_empty() {
            return Err(ReelError::MergeInconsistency {
                chunk_ids: misplaced.into_iter().collect(),
                detail: format!("chunk ids are not exactly 0..{}", n),
            });
        }

        let incomplete: Vec<usize> = sorted
            .iter()
            .filter(|s| !s.is_completed())
            .map(|s| s.chunk_id)
            .collect();
        if !incomplete.is_empty() {
            return Err(ReelError::MergeInconsistency {
                chunk_ids: incomplete,
                detail: "chunks did not complete".to_string(),
            });
        }

        let lacking: Vec<usize> = sorted
            .iter()
            .filter(|s| {
                self.order
                    .stages()
                    .iter()
                    .any(|stage| !s.stage_outputs.contains(*stage))
            })
            .map(|s| s.chunk_id)
            .collect();
        if !lacking.is_empty() {
            return Err(ReelError::MergeInconsistency {
                chunk_ids: lacking,
                detail: "chunks lack the output of a configured stage".to_string(),
            });
        }

        Ok(())
    }
}

fn scenes(payload: &Value) -> impl Iterator<Item = &Value> {
    payload
        .get("scenes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn scene_number(scene: &Value) -> Option<u64> {
    match scene.get("scene_number")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Entries of `payload[key]` that may carry a `scene_number`.
fn numbered_mut<'a>(payload: &'a mut Value, key: &str) -> impl Iterator<Item = &'a mut Value> {
    payload
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
}

/// Maps the chunk's local scene numbers densely onto the global sequence
/// starting at `next_scene`, rewriting every stage's scenes the same way.
fn renumber(outputs: &StageOutputs, next_scene: &mut u64) -> (StageOutputs, Option<(u64, u64)>) {
    let local: BTreeSet<u64> = outputs
        .iter()
        .flat_map(|(_, output)| scenes(&output.payload).filter_map(scene_number))
        .collect();

    let mapping: BTreeMap<u64, u64> = local
        .into_iter()
        .enumerate()
        .map(|(i, n)| (n, *next_scene + i as u64))
        .collect();

    let mut rewritten = outputs.clone();
    for (_, output) in rewritten.iter_mut() {
        for key in ["scenes", "feedbacks"] {
            for entry in numbered_mut(&mut output.payload, key) {
                if let Some(global) = scene_number(entry).and_then(|n| mapping.get(&n)) {
                    entry["scene_number"] = Value::from(*global);
                }
            }
        }
    }

    let range = match (mapping.values().next(), mapping.values().next_back()) {
        (Some(first), Some(last)) => Some((*first, *last)),
        _ => None,
    };
    *next_scene += mapping.len() as u64;
    (rewritten, range)
}

/// Character names mentioned in global scene `number` of `chunk`.
fn characters_in_scene(chunk: &MergedChunk, number: u64) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (_, output) in chunk.outputs.iter() {
        for scene in scenes(&output.payload).filter(|s| scene_number(s) == Some(number)) {
            if let Some(list) = scene.get("characters").and_then(Value::as_array) {
                for entry in list {
                    let name = entry
                        .as_str()
                        .or_else(|| entry.get("name").and_then(Value::as_str));
                    if let Some(name) = name {
                        names.insert(name.trim().to_string());
                    }
                }
            }
            if let Some(lines) = scene.get("dialogue").and_then(Value::as_array) {
                for line in lines {
                    if let Some(name) = line.get("character").and_then(Value::as_str) {
                        names.insert(name.trim().to_string());
                    }
                }
            }
        }
    }
    names.remove("");
    names
}

fn boundary(before: &MergedChunk, after: &MergedChunk) -> ChunkBoundary {
    let last_scene = before.scene_range.map(|(_, last)| last);
    let first_scene = after.scene_range.map(|(first, _)| first);

    let shared_characters = match (last_scene, first_scene) {
        (Some(last), Some(first)) => {
            let left = characters_in_scene(before, last);
            let right = characters_in_scene(after, first);
            left.intersection(&right).cloned().collect()
        }
        _ => Vec::new(),
    };

    ChunkBoundary {
        before_chunk: before.chunk_id,
        after_chunk: after.chunk_id,
        last_scene,
        first_scene,
        shared_characters,
    }
}
