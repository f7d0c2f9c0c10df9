//! Storyboard pipeline example.
//!
//! This example demonstrates:
//! - Building a workflow from a TOML configuration
//! - Mock stages standing in for language-model calls
//! - A director that sends one chunk back for revision
//! - A human review gate consulted before the director
//! - Observing progress events
//! - Printing the run report and the merged storyboard
//!
//! Run with: `cargo run --example storyboard_pipeline`
//! Set `RUST_LOG=storyreel=debug` to see the engine's spans.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use storyreel::{
    CallbackGate, EventKind, MemoryStateStore, PipelineConfig, Result, ReviewVerdict, Stage,
    StageId, StageInput, StageOutput, StageResult, StateStore, TracingSink, Workflow,
};

const CONFIG: &str = r#"
max_chunk_size = 400
chunk_overlap = 60
max_revisions = 2
concurrency_limit = 2
stage_order = ["writer", "visualizer", "sound_designer", "reviewer"]

[default_policy]
timeout_ms = 5000
retry_limit = 2
backoff_base_ms = 200
backoff_max_ms = 1000
jitter = true
"#;

const NOVEL: &str = "\
The rain had not stopped for three days. Mei stood at the window of the tea house, \
watching the lanterns sway along the harbour road.

Old Chen came in without knocking. He set a wet parcel on the counter and said nothing \
for a long time. \"They found the boat,\" he finally said.

***

By morning the harbour was full of strangers. Mei walked the pier twice, counting the \
hulls, until she found the one with the torn red sail.

Inside, the cabin smelled of salt and lamp oil. A ledger lay open on the table, its last \
page torn away. Mei pocketed it before anyone could see.";

/// Turns prose into numbered scenes.
#[derive(Debug)]
struct Writer;

#[async_trait]
impl Stage for Writer {
    fn id(&self) -> StageId {
        StageId::Writer
    }

    async fn execute(&self, input: &StageInput, _feedback: Option<&str>) -> StageResult {
        tokio::time::sleep(Duration::from_millis(80)).await;
        let scenes: Vec<Value> = input
            .source_text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "***")
            .enumerate()
            .map(|(i, paragraph)| {
                let characters: Vec<&str> = ["Mei", "Old Chen"]
                    .into_iter()
                    .filter(|name| paragraph.contains(name))
                    .collect();
                json!({
                    "scene_number": i + 1,
                    "action": paragraph,
                    "characters": characters,
                })
            })
            .collect();
        let summary = format!("{} scene(s)", scenes.len());
        Ok(StageOutput::new(json!({ "scenes": scenes })).with_summary(summary))
    }
}

/// Adds a shot description to every scene.
#[derive(Debug)]
struct Visualizer;

#[async_trait]
impl Stage for Visualizer {
    fn id(&self) -> StageId {
        StageId::Visualizer
    }

    async fn execute(&self, input: &StageInput, feedback: Option<&str>) -> StageResult {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let shot = if feedback.is_some() { "close-up" } else { "wide" };
        Ok(StageOutput::new(json!({ "scenes": annotate(input, "shot", shot) })))
    }
}

/// Adds an ambience cue to every scene.
#[derive(Debug)]
struct SoundDesigner;

#[async_trait]
impl Stage for SoundDesigner {
    fn id(&self) -> StageId {
        StageId::SoundDesigner
    }

    async fn execute(&self, input: &StageInput, _feedback: Option<&str>) -> StageResult {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(StageOutput::new(json!({ "scenes": annotate(input, "ambience", "rain on tiles") })))
    }
}

/// Approves everything except the first pass over the first chunk.
#[derive(Debug)]
struct Director;

#[async_trait]
impl Stage for Director {
    fn id(&self) -> StageId {
        StageId::Reviewer
    }

    async fn execute(&self, input: &StageInput, _feedback: Option<&str>) -> StageResult {
        if input.chunk_id == 0 && input.revision == 0 {
            let verdict = "Mostly fine, one note.\n```json\n{\"decision\": \"revise\", \
                \"feedbacks\": [{\"target_agent\": \"visualizer\", \"scene_number\": 1, \
                \"issue\": \"too distant\", \"instruction\": \"frame Mei's face\"}]}\n```";
            return Ok(StageOutput::new(Value::from(verdict)));
        }
        Ok(StageOutput::new(json!({ "decision": "approve" })))
    }
}

fn annotate(input: &StageInput, key: &str, value: &str) -> Vec<Value> {
    input
        .prior(StageId::Writer)
        .and_then(|w| w.payload["scenes"].as_array())
        .map(|scenes| {
            scenes
                .iter()
                .map(|s| {
                    let mut scene = serde_json::Map::new();
                    scene.insert("scene_number".to_string(), s["scene_number"].clone());
                    scene.insert(key.to_string(), Value::from(value));
                    Value::Object(scene)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("╔═══════════════════════════════════════════╗");
    println!("║  Storyreel Storyboard Pipeline Example    ║");
    println!("╚═══════════════════════════════════════════╝\n");

    let config = PipelineConfig::from_toml_str(CONFIG)?;
    let store = MemoryStateStore::new();

    println!("📋 Building workflow...");
    let workflow = Workflow::builder()
        .config(config)
        .stage(Writer)
        .stage(Visualizer)
        .stage(SoundDesigner)
        .stage(Director)
        // Stands in for a person reading each chunk before the director.
        .review_gate(CallbackGate::new(|input: &StageInput| {
            if input.chunk_id == 1 {
                ReviewVerdict::revise(StageId::SoundDesigner, "the harbour needs gulls")
            } else {
                ReviewVerdict::Approve
            }
        }))
        .sink(TracingSink)
        .store(store.clone())
        .build()?;
    println!("   Stages: {:?}\n", workflow.order().stages());

    let plan = workflow.plan(NOVEL)?;
    println!(
        "📄 {} characters, about {} chunk(s)\n",
        plan.total_chars, plan.estimated_chunks
    );

    let mut events = workflow.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event.kind {
                EventKind::StageCompleted => println!(
                    "   [chunk {}] {} done{}",
                    event.chunk_id,
                    event.stage.map(|s| s.to_string()).unwrap_or_default(),
                    event
                        .summary
                        .as_deref()
                        .map(|s| format!(" ({})", s))
                        .unwrap_or_default()
                ),
                EventKind::RevisionRequested { target } => println!(
                    "   [chunk {}] ↩ sent back to {}",
                    event.chunk_id, target
                ),
                EventKind::HumanApproved => {
                    println!("   [chunk {}] 👤 passed human review", event.chunk_id)
                }
                EventKind::Approved => println!("   [chunk {}] ✓ approved", event.chunk_id),
                EventKind::ForcedApproval => {
                    println!("   [chunk {}] ⚠ forced approval", event.chunk_id)
                }
                _ => {}
            }
        }
    });

    println!("▶️  Running");
    println!("─────────────────────────────────────────");
    let report = workflow.run(NOVEL).await?;
    let merger = workflow.merger();
    drop(workflow);
    let _ = printer.await;

    println!("\n📊 Run report:");
    println!("─────────────────────────────────────────");
    println!("{}", report);

    let archived = store.list_chunk_states(report.run_id).await?;
    let artifact = merger.merge(&archived)?;

    println!("🎬 Storyboard: {} scene(s)", artifact.total_scenes);
    for boundary in &artifact.boundaries {
        println!(
            "   chunk {} → {}: carries over {:?}",
            boundary.before_chunk, boundary.after_chunk, boundary.shared_characters
        );
    }
    println!("\n{}", artifact.to_json()?);

    Ok(())
}
