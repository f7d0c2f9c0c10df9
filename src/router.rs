//! Review verdicts and the revision router.
//!
//! The reviewer's structured output is decoded into a [`ReviewVerdict`];
//! [`RevisionRouter::route`] then decides whether the chunk terminates or
//! re-enters the pipeline, and applies the corresponding state changes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{ReelError, Result, StageError, StageId, StageOrder, WorkflowState};

/// Decision issued by the review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// Accept the chunk as is.
    Approve,
    /// Send the chunk back to `target`.
    Revise {
        /// Stage that must redo its work.
        target: StageId,
        /// Every instruction of the verdict, as one text.
        feedback: String,
        /// Instructions split by the stage they address. Empty for a
        /// single-target verdict, whose `feedback` all goes to `target`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        notes: BTreeMap<StageId, String>,
    },
}

/// Wire form of a reviewer verdict.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    decision: String,
    #[serde(default, alias = "target_agent")]
    target: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    feedbacks: Vec<RawNote>,
}

/// One note of a multi-note verdict.
#[derive(Debug, Deserialize)]
struct RawNote {
    #[serde(alias = "target_agent")]
    target: String,
    #[serde(default)]
    scene_number: Option<u64>,
    #[serde(default)]
    issue: String,
    #[serde(default)]
    instruction: String,
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]+?)\s*```").expect("valid regex"))
}

fn malformed(detail: impl Into<String>) -> ReelError {
    ReelError::StageFailure {
        stage: StageId::Reviewer,
        attempts: 1,
        source: StageError::Malformed(detail.into()),
    }
}

impl ReviewVerdict {
    /// Decodes the reviewer's payload.
    ///
    /// The payload is either a JSON object or a string holding one (bare,
    /// inside a fenced code block, or embedded in surrounding prose). Three
    /// object shapes are accepted:
    ///
    /// * `{"decision": "approve"}`
    /// * `{"decision": "revise", "target": "visualizer", "feedback": "..."}`
    /// * `{"decision": "revise", "feedbacks": [{"target": "...", "issue": "...",
    ///   "instruction": "..."}, ...]}`
    ///
    /// For the multi-note form the earliest target in pipeline order becomes
    /// the revision target, all notes are joined into `feedback`, and each
    /// note is also kept under the stage it names in `notes` so the router
    /// can hand every rerun stage only its own instructions. A top-level
    /// `feedback` next to `feedbacks` goes to the revision target.
    /// Decision keywords are case-insensitive.
    ///
    /// # Errors
    ///
    /// * [`ReelError::InvalidVerdict`] if a target names no known stage.
    /// * [`ReelError::StageFailure`] with [`StageError::Malformed`] if the
    ///   payload cannot be decoded at all. The engine replaces `attempts`
    ///   with the real invocation count.
    pub fn from_payload(payload: &Value, order: &StageOrder) -> Result<Self> {
        let raw: RawVerdict = match payload {
            Value::String(text) => {
                let object = extract_json(text)
                    .ok_or_else(|| malformed("no JSON verdict found in reviewer output"))?;
                serde_json::from_value(object).map_err(|e| malformed(e.to_string()))?
            }
            other => serde_json::from_value(other.clone()).map_err(|e| malformed(e.to_string()))?,
        };

        match raw.decision.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approve),
            "revise" => Self::revise_from(raw, order),
            other => Err(malformed(format!("unknown decision '{}'", other))),
        }
    }

    /// A single-target `Revise`.
    pub fn revise(target: StageId, feedback: impl Into<String>) -> Self {
        Self::Revise {
            target,
            feedback: feedback.into(),
            notes: BTreeMap::new(),
        }
    }

    fn revise_from(raw: RawVerdict, order: &StageOrder) -> Result<Self> {
        if let Some(target) = raw.target {
            let target = parse_target(&target)?;
            return Ok(Self::revise(target, raw.feedback.unwrap_or_default()));
        }

        if raw.feedbacks.is_empty() {
            return Err(malformed("revise verdict without a target"));
        }

        let mut parsed = Vec::with_capacity(raw.feedbacks.len());
        for note in &raw.feedbacks {
            parsed.push((parse_target(&note.target)?, note));
        }

        let target = parsed
            .iter()
            .map(|(stage, _)| *stage)
            .min_by_key(|stage| order.position(*stage).unwrap_or(usize::MAX))
            .ok_or_else(|| malformed("revise verdict without a target"))?;

        let mut lines = Vec::with_capacity(parsed.len() + 1);
        let mut notes: BTreeMap<StageId, String> = BTreeMap::new();
        let general = raw.feedback.filter(|f| !f.is_empty());
        if let Some(general) = &general {
            lines.push(general.clone());
            notes.insert(target, general.clone());
        }
        for (stage, note) in &parsed {
            let scene = note
                .scene_number
                .map(|n| format!("scene {}: ", n))
                .unwrap_or_default();
            let text = format!("{}{} {}", scene, note.issue, note.instruction)
                .trim()
                .to_string();
            lines.push(format!("[{}] {}", stage, text));

            let entry = notes.entry(*stage).or_default();
            if !entry.is_empty() {
                entry.push('\n');
            }
            entry.push_str(&text);
        }

        Ok(Self::Revise {
            target,
            feedback: lines.join("\n"),
            notes,
        })
    }

    /// Returns true for `Approve`.
    pub fn is_approve(&self) -> bool {
        matches!(self, Self::Approve)
    }

    /// The full feedback text of a `Revise`.
    pub fn feedback(&self) -> Option<&str> {
        match self {
            Self::Revise { feedback, .. } => Some(feedback),
            Self::Approve => None,
        }
    }
}

fn parse_target(name: &str) -> Result<StageId> {
    name.parse::<StageId>()
        .map_err(|_| ReelError::InvalidVerdict(format!("unknown revision target '{}'", name)))
}

/// Finds the JSON object in free-form reviewer text.
fn extract_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    if let Some(caps) = fenced_json().captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start < end {
        serde_json::from_str(&text[start..=end]).ok()
    } else {
        None
    }
}

/// What the engine does with a chunk after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The chunk is done. `forced` is set when the revision budget ran out.
    Terminate {
        /// True if a `Revise` was converted into an approval.
        forced: bool,
    },
    /// Resume execution at this stage.
    ReenterAt(StageId),
}

/// Applies review verdicts to chunk state.
#[derive(Debug, Clone)]
pub struct RevisionRouter {
    order: StageOrder,
    max_revisions: u32,
}

impl RevisionRouter {
    /// Creates a router for `order` allowing `max_revisions` backward routes
    /// per chunk.
    pub fn new(order: StageOrder, max_revisions: u32) -> Self {
        Self {
            order,
            max_revisions,
        }
    }

    /// The revision budget per chunk.
    pub fn max_revisions(&self) -> u32 {
        self.max_revisions
    }

    /// Returns true once `state` has used its whole revision budget. Any
    /// further `Revise` is converted into a forced approval.
    pub fn is_exhausted(&self, state: &WorkflowState) -> bool {
        state.revision_count >= self.max_revisions
    }

    /// Routes `verdict` for `state`.
    ///
    /// The revision budget is checked before the target: once it is spent,
    /// every `Revise` ends the chunk with a forced approval, whatever it
    /// names. Otherwise, on `ReenterAt(target)` the outputs of `target` and
    /// every later stage are cleared, `revision_count` is incremented and
    /// the feedback is stashed per stage. Every accepted verdict is appended
    /// to `review_history`.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::InvalidVerdict`] if the budget is not spent and
    /// the target does not run strictly before the reviewer. The state is
    /// left untouched.
    pub fn route(&self, state: &mut WorkflowState, verdict: ReviewVerdict) -> Result<RouteDecision> {
        let (target, feedback, notes) = match verdict {
            ReviewVerdict::Approve => {
                state.review_history.push(ReviewVerdict::Approve);
                info!(chunk_id = state.chunk_id, "chunk approved");
                return Ok(RouteDecision::Terminate { forced: false });
            }
            ReviewVerdict::Revise {
                target,
                feedback,
                notes,
            } => (target, feedback, notes),
        };

        if self.is_exhausted(state) {
            let reason = format!("revision requested for {}", target);
            state.review_history.push(ReviewVerdict::Revise {
                target,
                feedback,
                notes,
            });
            return Ok(self.force_approval(state, &reason));
        }

        if !self.order.is_upstream_of_reviewer(target) {
            return Err(ReelError::InvalidVerdict(format!(
                "revision target {} does not run before {}",
                target,
                self.order.reviewer()
            )));
        }

        let discarded = self.order.from_stage(target)?;
        let mut pending: BTreeMap<StageId, String> = notes
            .iter()
            .filter(|(stage, _)| discarded.contains(*stage))
            .map(|(stage, text)| (*stage, text.clone()))
            .collect();
        if !pending.contains_key(&target) {
            pending.insert(target, feedback.clone());
        }

        state.review_history.push(ReviewVerdict::Revise {
            target,
            feedback,
            notes,
        });
        state.revision_count += 1;
        state.stage_outputs.remove_all(&discarded);
        state.pending_feedback = pending;
        info!(
            chunk_id = state.chunk_id,
            revision = state.revision_count,
            target = %target,
            "chunk sent back for revision"
        );

        Ok(RouteDecision::ReenterAt(target))
    }

    /// Ends the chunk as a forced approval without consulting the verdict.
    ///
    /// Used when the budget is spent and the reviewer's output names a
    /// target that cannot be decoded at all.
    pub fn force_approval(&self, state: &mut WorkflowState, reason: &str) -> RouteDecision {
        state.forced_approval = true;
        warn!(
            chunk_id = state.chunk_id,
            revisions = state.revision_count,
            reason,
            "revision budget exhausted, forcing approval"
        );
        RouteDecision::Terminate { forced: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, StageOutput};
    use proptest::prelude::*;
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

    fn full_state() -> WorkflowState {
        let mut state = WorkflowState::new(Chunk::new(0, "text"));
        for stage in order().stages() {
            state.record_output(*stage, StageOutput::new(json!(stage.as_str())));
        }
        state
    }

    fn revise(target: StageId) -> ReviewVerdict {
        ReviewVerdict::revise(target, "again")
    }

    #[test]
    fn test_decode_approve() {
        let verdict = ReviewVerdict::from_payload(&json!({"decision": "APPROVE"}), &order()).unwrap();
        assert_eq!(verdict, ReviewVerdict::Approve);
    }

    #[test]
    fn test_decode_single_target() {
        let verdict = ReviewVerdict::from_payload(
            &json!({"decision": "revise", "target": "visualizer", "feedback": "wider shots"}),
            &order(),
        )
        .unwrap();
        assert_eq!(verdict, ReviewVerdict::revise(StageId::Visualizer, "wider shots"));
    }

    #[test]
    fn test_decode_prompt_stage_names() {
        let verdict = ReviewVerdict::from_payload(
            &json!({"decision": "revise", "target_agent": "storyboard", "feedback": "tighter"}),
            &order(),
        )
        .unwrap();
        assert_eq!(verdict, ReviewVerdict::revise(StageId::Visualizer, "tighter"));

        let verdict = ReviewVerdict::from_payload(
            &json!({"decision": "revise", "feedbacks": [
                {"target_agent": "screenwriter", "issue": "slow", "instruction": "cut"}
            ]}),
            &order(),
        )
        .unwrap();
        assert!(matches!(verdict, ReviewVerdict::Revise { target: StageId::Writer, .. }));
    }

    #[test]
    fn test_decode_multi_note_picks_earliest_target() {
        let verdict = ReviewVerdict::from_payload(
            &json!({
                "decision": "REVISE",
                "feedbacks": [
                    {"target_agent": "sound_designer", "scene_number": 2, "issue": "too loud", "instruction": "soften rain"},
                    {"target": "writer", "issue": "flat dialogue", "instruction": "add subtext"}
                ]
            }),
            &order(),
        )
        .unwrap();

        match verdict {
            ReviewVerdict::Revise {
                target,
                feedback,
                notes,
            } => {
                assert_eq!(target, StageId::Writer);
                assert!(feedback.contains("[sound_designer] scene 2: too loud soften rain"));
                assert!(feedback.contains("[writer] flat dialogue add subtext"));
                assert_eq!(notes[&StageId::SoundDesigner], "scene 2: too loud soften rain");
                assert_eq!(notes[&StageId::Writer], "flat dialogue add subtext");
            }
            other => panic!("expected revise, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_multi_note_groups_notes_per_stage() {
        let verdict = ReviewVerdict::from_payload(
            &json!({
                "decision": "revise",
                "feedback": "keep the mood",
                "feedbacks": [
                    {"target": "visualizer", "scene_number": 1, "issue": "flat", "instruction": "low angle"},
                    {"target": "visualizer", "scene_number": 3, "issue": "dark", "instruction": "add a lamp"}
                ]
            }),
            &order(),
        )
        .unwrap();

        let ReviewVerdict::Revise { target, notes, .. } = verdict else {
            panic!("expected revise");
        };
        assert_eq!(target, StageId::Visualizer);
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[&StageId::Visualizer],
            "keep the mood\nscene 1: flat low angle\nscene 3: dark add a lamp"
        );
    }

    #[test]
    fn test_decode_from_fenced_text() {
        let text = "Looks fine overall.\n```json\n{\"decision\": \"approve\"}\n```";
        let verdict = ReviewVerdict::from_payload(&json!(text), &order()).unwrap();
        assert!(verdict.is_approve());
    }

    #[test]
    fn test_decode_unknown_target_is_invalid_verdict() {
        let err = ReviewVerdict::from_payload(
            &json!({"decision": "revise", "target": "narrator"}),
            &order(),
        )
        .unwrap_err();
        assert!(matches!(err, ReelError::InvalidVerdict(_)));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = ReviewVerdict::from_payload(&json!("no verdict here"), &order()).unwrap_err();
        assert!(matches!(
            err,
            ReelError::StageFailure {
                source: StageError::Malformed(_),
                ..
            }
        ));

        let err = ReviewVerdict::from_payload(&json!({"decision": "maybe"}), &order()).unwrap_err();
        assert_eq!(err.kind(), "stage_failure");
    }

    #[test]
    fn test_approve_terminates() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let decision = router.route(&mut state, ReviewVerdict::Approve).unwrap();

        assert_eq!(decision, RouteDecision::Terminate { forced: false });
        assert_eq!(state.review_history.len(), 1);
        assert_eq!(state.revision_count, 0);
        assert!(!state.forced_approval);
    }

    #[test]
    fn test_revise_clears_target_and_downstream() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let decision = router.route(&mut state, revise(StageId::Visualizer)).unwrap();

        assert_eq!(decision, RouteDecision::ReenterAt(StageId::Visualizer));
        assert_eq!(state.revision_count, 1);
        assert_eq!(state.stage_outputs.stages(), vec![StageId::Writer]);
        assert_eq!(state.feedback_for(StageId::Visualizer), Some("again"));
    }

    #[test]
    fn test_multi_note_feedback_reaches_each_stage() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let verdict = ReviewVerdict::from_payload(
            &json!({"decision": "revise", "feedbacks": [
                {"target_agent": "sound_designer", "scene_number": 2, "issue": "too quiet", "instruction": "add rain"},
                {"target_agent": "visualizer", "issue": "flat", "instruction": "low angle"}
            ]}),
            &order(),
        )
        .unwrap();

        let decision = router.route(&mut state, verdict).unwrap();
        assert_eq!(decision, RouteDecision::ReenterAt(StageId::Visualizer));
        assert_eq!(state.feedback_for(StageId::Visualizer), Some("flat low angle"));
        assert_eq!(
            state.feedback_for(StageId::SoundDesigner),
            Some("scene 2: too quiet add rain")
        );
        assert_eq!(state.feedback_for(StageId::Writer), None);
        assert_eq!(state.feedback_for(StageId::Reviewer), None);
    }

    #[test]
    fn test_notes_for_kept_stages_are_dropped() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let mut notes = BTreeMap::new();
        notes.insert(StageId::Writer, "never delivered".to_string());
        notes.insert(StageId::SoundDesigner, "louder".to_string());
        let verdict = ReviewVerdict::Revise {
            target: StageId::SoundDesigner,
            feedback: "louder".to_string(),
            notes,
        };

        router.route(&mut state, verdict).unwrap();
        assert_eq!(state.pending_feedback.len(), 1);
        assert_eq!(state.feedback_for(StageId::SoundDesigner), Some("louder"));
    }

    #[test]
    fn test_reviewer_target_is_invalid() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let before = state.clone();

        let err = router.route(&mut state, revise(StageId::Reviewer)).unwrap_err();
        assert!(matches!(err, ReelError::InvalidVerdict(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_unconfigured_target_is_invalid() {
        let router = RevisionRouter::new(order(), 3);
        let mut state = full_state();
        let err = router
            .route(&mut state, revise(StageId::CharacterExtractor))
            .unwrap_err();
        assert!(matches!(err, ReelError::InvalidVerdict(_)));
    }

    #[test]
    fn test_cap_checked_before_target_validity() {
        let router = RevisionRouter::new(order(), 0);
        let mut state = full_state();
        let decision = router.route(&mut state, revise(StageId::Reviewer)).unwrap();

        assert_eq!(decision, RouteDecision::Terminate { forced: true });
        assert!(state.forced_approval);
        assert_eq!(state.review_history, vec![revise(StageId::Reviewer)]);
        assert_eq!(state.stage_outputs.len(), 4);

        let mut state = full_state();
        state.revision_count = 2;
        let router = RevisionRouter::new(order(), 2);
        let decision = router
            .route(&mut state, revise(StageId::CharacterExtractor))
            .unwrap();
        assert_eq!(decision, RouteDecision::Terminate { forced: true });
        assert_eq!(state.revision_count, 2);
    }

    #[test]
    fn test_force_approval_leaves_history_alone() {
        let router = RevisionRouter::new(order(), 0);
        let mut state = full_state();
        assert!(router.is_exhausted(&state));

        let decision = router.force_approval(&mut state, "unknown revision target 'narrator'");
        assert_eq!(decision, RouteDecision::Terminate { forced: true });
        assert!(state.forced_approval);
        assert!(state.review_history.is_empty());
    }

    #[test]
    fn test_zero_budget_forces_approval() {
        let router = RevisionRouter::new(order(), 0);
        let mut state = full_state();
        let decision = router.route(&mut state, revise(StageId::Writer)).unwrap();

        assert_eq!(decision, RouteDecision::Terminate { forced: true });
        assert_eq!(state.review_history.len(), 1);
        assert_eq!(state.revision_count, 0);
        assert!(state.forced_approval);
        assert_eq!(state.stage_outputs.len(), 4);
    }

    proptest! {
        #[test]
        fn prop_revision_count_never_exceeds_cap(
            max in 0u32..6,
            targets in proptest::collection::vec(0usize..3, 1..12),
        ) {
            let router = RevisionRouter::new(order(), max);
            let mut state = full_state();
            let stages = [StageId::Writer, StageId::Visualizer, StageId::SoundDesigner];

            for (i, t) in targets.iter().enumerate() {
                let decision = router.route(&mut state, revise(stages[*t])).unwrap();
                prop_assert!(state.revision_count <= max);
                if (i as u32) < max {
                    prop_assert_eq!(decision, RouteDecision::ReenterAt(stages[*t]));
                } else {
                    prop_assert_eq!(decision, RouteDecision::Terminate { forced: true });
                    break;
                }
            }
        }
    }
}
