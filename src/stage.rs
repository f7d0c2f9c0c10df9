//! Stage types for the storyreel workflow engine.
//!
//! This module defines the closed set of stage identifiers, the input and
//! output bundles that flow between stages, and the [`Stage`] trait every
//! transformation step implements.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ReelError, StageError};

/// Identifier of a pipeline stage.
///
/// The set is closed so that revision targets can be validated instead of
/// being matched as free-form strings. Which of these stages run, and in
/// which order, is decided by configuration.
///
/// The names used by storyboard prompts (`screenwriter`, `storyboard`,
/// `director`) are accepted as aliases when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Extracts character profiles and the visual style of the world.
    CharacterExtractor,
    /// Turns prose into scenes with action and dialogue.
    #[serde(alias = "screenwriter")]
    Writer,
    /// Produces shot types and image prompts per scene.
    #[serde(alias = "storyboard", alias = "storyboard_artist")]
    Visualizer,
    /// Designs ambience, foley and music cues per scene.
    SoundDesigner,
    /// Reviews the other stages and issues a verdict.
    #[serde(alias = "director")]
    Reviewer,
}

impl StageId {
    /// All stage identifiers, in their conventional pipeline order.
    pub const ALL: [StageId; 5] = [
        StageId::CharacterExtractor,
        StageId::Writer,
        StageId::Visualizer,
        StageId::SoundDesigner,
        StageId::Reviewer,
    ];

    /// Returns the snake_case name used in configuration and verdicts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CharacterExtractor => "character_extractor",
            Self::Writer => "writer",
            Self::Visualizer => "visualizer",
            Self::SoundDesigner => "sound_designer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ReelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "screenwriter" | "script_writer" => return Ok(StageId::Writer),
            "storyboard" | "storyboard_artist" => return Ok(StageId::Visualizer),
            "director" => return Ok(StageId::Reviewer),
            _ => {}
        }
        StageId::ALL
            .into_iter()
            .find(|id| id.as_str() == normalized)
            .ok_or_else(|| ReelError::StageNotFound(s.to_string()))
    }
}

/// Structured output of one successful stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The stage's structured result. The engine only looks inside it for
    /// the reviewer's verdict and for `scenes[].scene_number` when merging.
    pub payload: serde_json::Value,

    /// Optional one-line summary used in progress events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl StageOutput {
    /// Creates an output without a summary.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            summary: None,
        }
    }

    /// Attaches a human-readable summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Outcome of a single stage invocation.
pub type StageResult = std::result::Result<StageOutput, StageError>;

/// Accepted stage outputs of one chunk, kept in execution order.
///
/// Because stages run strictly in pipeline order and re-entry discards the
/// target and everything after it, insertion order always matches pipeline
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    entries: Vec<(StageId, StageOutput)>,
}

impl StageOutputs {
    /// Creates an empty set of outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an output, overwriting an earlier one for the same stage in
    /// place.
    pub fn insert(&mut self, stage: StageId, output: StageOutput) {
        match self.entries.iter_mut().find(|(id, _)| *id == stage) {
            Some(entry) => entry.1 = output,
            None => self.entries.push((stage, output)),
        }
    }

    /// Returns the output of `stage`, if it has completed.
    pub fn get(&self, stage: StageId) -> Option<&StageOutput> {
        self.entries
            .iter()
            .find(|(id, _)| *id == stage)
            .map(|(_, output)| output)
    }

    /// Returns a mutable reference to the output of `stage`.
    pub fn get_mut(&mut self, stage: StageId) -> Option<&mut StageOutput> {
        self.entries
            .iter_mut()
            .find(|(id, _)| *id == stage)
            .map(|(_, output)| output)
    }

    /// Returns true if `stage` has an accepted output.
    pub fn contains(&self, stage: StageId) -> bool {
        self.get(stage).is_some()
    }

    /// Drops the outputs of every listed stage.
    pub fn remove_all(&mut self, stages: &[StageId]) {
        self.entries.retain(|(id, _)| !stages.contains(id));
    }

    /// Stage ids with outputs, in execution order.
    pub fn stages(&self) -> Vec<StageId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    /// Iterates over `(stage, output)` pairs in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (StageId, &StageOutput)> {
        self.entries.iter().map(|(id, output)| (*id, output))
    }

    /// Iterates mutably over outputs in execution order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (StageId, &mut StageOutput)> {
        self.entries.iter_mut().map(|(id, output)| (*id, output))
    }

    /// Number of stages with outputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no stage has completed yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a stage gets to see for one invocation.
///
/// Built fresh from the chunk's workflow state before each call, so two
/// invocations with equal inputs and feedback see exactly the same data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageInput {
    /// Ordinal of the chunk within the source text.
    pub chunk_id: usize,

    /// The chunk's text.
    pub source_text: String,

    /// Opening text of the following chunk, for continuity only.
    pub lookahead: Option<String>,

    /// Outputs of every stage that precedes this one, in pipeline order.
    pub prior_outputs: Vec<(StageId, StageOutput)>,

    /// How many times the chunk has been sent back for revision so far.
    pub revision: u32,

    /// Caller-supplied cross-chunk context (for example a character sheet).
    pub continuity: Option<serde_json::Value>,
}

impl StageInput {
    /// Returns the output of an earlier stage, if it was handed to this one.
    pub fn prior(&self, stage: StageId) -> Option<&StageOutput> {
        self.prior_outputs
            .iter()
            .find(|(id, _)| *id == stage)
            .map(|(_, output)| output)
    }
}

/// A trait representing a transformation stage of the pipeline.
///
/// Implementations are opaque to the engine: typically each one wraps a
/// language-model call. A stage must not depend on mutable context beyond
/// its arguments, so that repeating a call with the same `(input, feedback)`
/// pair is safe.
///
/// # Object Safety
///
/// This trait is object-safe, allowing for dynamic dispatch with `dyn Stage`.
///
/// # Examples
///
/// ```
/// use storyreel::{Stage, StageId, StageInput, StageOutput, StageResult};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct Writer;
///
/// #[async_trait]
/// impl Stage for Writer {
///     fn id(&self) -> StageId {
///         StageId::Writer
///     }
///
///     async fn execute(&self, input: &StageInput, _feedback: Option<&str>) -> StageResult {
///         Ok(StageOutput::new(serde_json::json!({
///             "scenes": [{ "scene_number": 1, "action": input.source_text }]
///         })))
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: fmt::Debug + Send + Sync {
    /// Which pipeline slot this stage fills.
    fn id(&self) -> StageId;

    /// Runs the stage once.
    ///
    /// `feedback` is set only when the chunk re-enters the pipeline at this
    /// stage after a `Revise` verdict.
    async fn execute(&self, input: &StageInput, feedback: Option<&str>) -> StageResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_id_display_and_parse() {
        for id in StageId::ALL {
            assert_eq!(id.to_string().parse::<StageId>().unwrap(), id);
        }
        assert_eq!("Sound-Designer".parse::<StageId>().unwrap(), StageId::SoundDesigner);
    }

    #[test]
    fn test_stage_id_parse_unknown() {
        let err = "narrator".parse::<StageId>().unwrap_err();
        assert!(matches!(err, ReelError::StageNotFound(ref name) if name == "narrator"));
    }

    #[test]
    fn test_stage_id_prompt_aliases() {
        assert_eq!("screenwriter".parse::<StageId>().unwrap(), StageId::Writer);
        assert_eq!("Storyboard".parse::<StageId>().unwrap(), StageId::Visualizer);
        assert_eq!("storyboard-artist".parse::<StageId>().unwrap(), StageId::Visualizer);
        assert_eq!("director".parse::<StageId>().unwrap(), StageId::Reviewer);

        let ids: Vec<StageId> =
            serde_json::from_str(r#"["screenwriter", "storyboard", "director"]"#).unwrap();
        assert_eq!(ids, vec![StageId::Writer, StageId::Visualizer, StageId::Reviewer]);
        // Aliases never leak into output.
        assert_eq!(serde_json::to_string(&StageId::Writer).unwrap(), r#""writer""#);
    }

    #[test]
    fn test_stage_id_serde() {
        let json = serde_json::to_string(&StageId::SoundDesigner).unwrap();
        assert_eq!(json, r#""sound_designer""#);
        let id: StageId = serde_json::from_str(r#""visualizer""#).unwrap();
        assert_eq!(id, StageId::Visualizer);
    }

    #[test]
    fn test_stage_outputs_overwrite_in_place() {
        let mut outputs = StageOutputs::new();
        outputs.insert(StageId::Writer, StageOutput::new(json!(1)));
        outputs.insert(StageId::Visualizer, StageOutput::new(json!(2)));
        outputs.insert(StageId::Writer, StageOutput::new(json!(3)));

        assert_eq!(outputs.stages(), vec![StageId::Writer, StageId::Visualizer]);
        assert_eq!(outputs.get(StageId::Writer).unwrap().payload, json!(3));
    }

    #[test]
    fn test_stage_outputs_remove_all() {
        let mut outputs = StageOutputs::new();
        outputs.insert(StageId::Writer, StageOutput::new(json!(1)));
        outputs.insert(StageId::Visualizer, StageOutput::new(json!(2)));
        outputs.insert(StageId::Reviewer, StageOutput::new(json!(3)));

        outputs.remove_all(&[StageId::Visualizer, StageId::SoundDesigner, StageId::Reviewer]);
        assert_eq!(outputs.stages(), vec![StageId::Writer]);
        assert!(!outputs.contains(StageId::Reviewer));
    }

    #[test]
    fn test_stage_output_summary() {
        let output = StageOutput::new(json!({})).with_summary("3 scenes");
        assert_eq!(output.summary.as_deref(), Some("3 scenes"));
        let json = serde_json::to_string(&StageOutput::new(json!(null))).unwrap();
        assert!(!json.contains("summary"));
    }

    #[test]
    fn test_stage_input_prior_lookup() {
        let input = StageInput {
            chunk_id: 0,
            source_text: "text".to_string(),
            lookahead: None,
            prior_outputs: vec![(StageId::Writer, StageOutput::new(json!("draft")))],
            revision: 0,
            continuity: None,
        };
        assert_eq!(input.prior(StageId::Writer).unwrap().payload, json!("draft"));
        assert!(input.prior(StageId::Visualizer).is_none());
    }

    #[derive(Debug)]
    struct EchoStage;

    #[async_trait]
    impl Stage for EchoStage {
        fn id(&self) -> StageId {
            StageId::Writer
        }

        async fn execute(&self, input: &StageInput, feedback: Option<&str>) -> StageResult {
            Ok(StageOutput::new(json!({
                "text": input.source_text,
                "feedback": feedback,
            })))
        }
    }

    #[tokio::test]
    async fn test_stage_trait_object() {
        let stage: Box<dyn Stage> = Box::new(EchoStage);
        let input = StageInput {
            chunk_id: 2,
            source_text: "hello".to_string(),
            lookahead: None,
            prior_outputs: Vec::new(),
            revision: 1,
            continuity: None,
        };

        assert_eq!(stage.id(), StageId::Writer);
        let output = stage.execute(&input, Some("tighter")).await.unwrap();
        assert_eq!(output.payload["feedback"], json!("tighter"));
    }
}
