//! Workflow definition and execution.
//!
//! This module provides [`Workflow`] and [`WorkflowBuilder`]. A workflow
//! splits a text into chunks, drives every chunk through the configured
//! stages as an explicit state machine, routes reviewer verdicts back into
//! the pipeline, and hands the terminal states to the merger.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chunker::{self, Chunk, ChunkPlan};
use crate::{
    BroadcastSink, ChunkMerger, ChunkStatus, EventKind, MergedArtifact, PipelineConfig,
    ProgressEvent, ProgressReporter, ProgressSink, ReelError, Result, ReviewGate,
    ReviewVerdict, RevisionRouter, RouteDecision, RunReport, Stage, StageError, StageId,
    StageOrder, StageOutput, StateStore, WorkflowState,
};

/// A configured storyboard pipeline.
///
/// The workflow owns the registered stages, the validated stage order, the
/// revision router, the progress reporter and an optional state store. Runs
/// do not share mutable state, so one workflow can serve several runs.
///
/// # Construction
///
/// Use [`Workflow::builder()`] to create a new workflow:
///
/// ```
/// use storyreel::{PipelineConfig, StageId, Workflow};
/// # use storyreel::{Stage, StageInput, StageOutput, StageResult};
/// # use async_trait::async_trait;
/// # #[derive(Debug)]
/// # struct Echo(StageId);
/// # #[async_trait]
/// # impl Stage for Echo {
/// #     fn id(&self) -> StageId { self.0 }
/// #     async fn execute(&self, _input: &StageInput, _feedback: Option<&str>) -> StageResult {
/// #         Ok(StageOutput::new(serde_json::json!({"decision": "approve"})))
/// #     }
/// # }
///
/// let config = PipelineConfig {
///     stage_order: vec![StageId::Writer, StageId::Reviewer],
///     ..PipelineConfig::default()
/// };
///
/// let workflow = Workflow::builder()
///     .config(config)
///     .stage(Echo(StageId::Writer))
///     .stage(Echo(StageId::Reviewer))
///     .build()?;
/// # Ok::<(), storyreel::ReelError>(())
/// ```
///
/// # Thread Safety
///
/// `Workflow` is `Send + Sync` and can be shared across async tasks.
pub struct Workflow {
    stages: HashMap<StageId, Arc<dyn Stage>>,
    order: StageOrder,
    config: PipelineConfig,
    router: RevisionRouter,
    reporter: ProgressReporter,
    events: BroadcastSink,
    store: Option<Arc<dyn StateStore>>,
    gate: Option<Arc<dyn ReviewGate>>,
    continuity: Option<Value>,
}

impl Workflow {
    /// Creates a new workflow builder.
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Subscribes to progress events.
    ///
    /// Returns a receiver that will receive all events emitted by this
    /// workflow. Events are not persisted; if the receiver is too slow,
    /// events may be dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// The validated stage order.
    pub fn order(&self) -> &StageOrder {
        &self.order
    }

    /// The configuration the workflow was built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the number of registered stages that take part in runs.
    pub fn stage_count(&self) -> usize {
        self.order.len()
    }

    /// Returns true if `stage` takes part in runs.
    pub fn has_stage(&self, stage: StageId) -> bool {
        self.order.contains(stage) && self.stages.contains_key(&stage)
    }

    /// A merger expecting every configured stage.
    pub fn merger(&self) -> ChunkMerger {
        ChunkMerger::new(self.order.clone())
    }

    /// Pre-analyses `text` against the configured chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] if the chunk size is zero.
    pub fn plan(&self, text: &str) -> Result<ChunkPlan> {
        chunker::plan(text, self.config.max_chunk_size)
    }

    /// Splits `text` the way [`run`](Self::run) does.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] if the chunk size is zero.
    pub fn split(&self, text: &str) -> Result<Vec<Chunk>> {
        chunker::split_with_overlap(text, self.config.max_chunk_size, self.config.chunk_overlap)
    }

    /// Processes `text` and returns the terminal state of every chunk.
    ///
    /// Chunk failures are reported in the [`RunReport`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] if the text cannot be split.
    pub async fn run(&self, text: &str) -> Result<RunReport> {
        self.run_with_cancellation(text, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), stopping chunks cooperatively once `cancel`
    /// fires. Each chunk observes a child token of `cancel`.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::Configuration`] if the text cannot be split.
    pub async fn run_with_cancellation(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let chunks = self.split(text)?;
        Ok(self.run_chunks(chunks, cancel).await)
    }

    /// Processes `text` and merges the results.
    ///
    /// # Errors
    ///
    /// Returns [`ReelError::MergeInconsistency`] naming every failed chunk
    /// and its cause if any chunk did not complete.
    pub async fn run_to_artifact(&self, text: &str) -> Result<MergedArtifact> {
        let report = self.run(text).await?;
        if report.has_failures() {
            let detail = report
                .failures()
                .iter()
                .map(|(id, error)| format!("chunk {}: {}", id, error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ReelError::MergeInconsistency {
                chunk_ids: report.failed_chunks(),
                detail,
            });
        }
        report.merge(&self.merger())
    }

    /// Drives already-split chunks to terminal states.
    ///
    /// At most `concurrency_limit` chunks run at once. The report is ordered
    /// by `chunk_id` whatever the completion order was.
    pub async fn run_chunks(&self, chunks: Vec<Chunk>, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id, chunks = chunks.len());

        async {
            info!("starting run");
            let semaphore = Semaphore::new(self.config.concurrency_limit);

            let tasks = chunks.into_iter().map(|chunk| {
                let semaphore = &semaphore;
                let token = cancel.child_token();
                async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        permit = semaphore.acquire() => permit.ok(),
                    };
                    let state = self.run_chunk(chunk, &token).await;
                    self.archive(run_id, &state).await;
                    state
                }
            });

            let report = RunReport::new(run_id, join_all(tasks).await);
            info!(
                completed = report.chunks.len() - report.failed_chunks().len(),
                failed = report.failed_chunks().len(),
                forced = report.forced_approvals().len(),
                "run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Drives one chunk to a terminal state.
    ///
    /// Failures are recorded in the returned state rather than propagated.
    pub async fn run_chunk(&self, chunk: Chunk, cancel: &CancellationToken) -> WorkflowState {
        let span = info_span!("chunk", chunk_id = chunk.id);

        async {
            let mut state = WorkflowState::new(chunk);
            if let Err(e) = self.drive(&mut state, cancel).await {
                warn!(error = %e, kind = e.kind(), "chunk failed");
                state.mark_failed(&e);
                self.emit(&state, EventKind::StatusChanged, Some(e.to_string()))
                    .await;
            }
            state
        }
        .instrument(span)
        .await
    }

    /// The chunk state machine.
    async fn drive(&self, state: &mut WorkflowState, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ReelError::Cancelled);
        }
        self.transition(state, ChunkStatus::Running, None).await?;

        let reviewer = self.order.reviewer();
        let mut start = 0;
        'pass: loop {
            let mut reviewer_attempts = 1;
            for &stage in &self.order.stages()[start..] {
                if cancel.is_cancelled() {
                    return Err(ReelError::Cancelled);
                }
                if stage == reviewer {
                    if let Some((decision, feedback)) = self.consult_gate(state, cancel).await? {
                        match self.settle(state, decision, feedback).await? {
                            Some(next) => {
                                start = next;
                                continue 'pass;
                            }
                            None => return Ok(()),
                        }
                    }
                }
                state.current_stage = Some(stage);
                let (output, attempts) = self.invoke(state, stage, cancel).await?;
                if stage == reviewer {
                    reviewer_attempts = attempts;
                }
                state.record_output(stage, output);
            }

            self.transition(state, ChunkStatus::AwaitingReview, None)
                .await?;
            let (decision, feedback) = match self.decode_verdict(state, reviewer_attempts) {
                Ok(verdict) => {
                    let feedback = verdict.feedback().map(str::to_owned);
                    (self.router.route(state, verdict)?, feedback)
                }
                Err(ReelError::InvalidVerdict(detail)) if self.router.is_exhausted(state) => {
                    (self.router.force_approval(state, &detail), None)
                }
                Err(e) => return Err(e),
            };

            match self.settle(state, decision, feedback).await? {
                Some(next) => start = next,
                None => return Ok(()),
            }
        }
    }

    /// Asks the human review gate, once per chunk.
    ///
    /// Returns `None` when the chunk should go on to the reviewer stage.
    async fn consult_gate(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<Option<(RouteDecision, Option<String>)>> {
        let Some(gate) = &self.gate else {
            return Ok(None);
        };
        if state.human_reviewed || self.router.is_exhausted(state) {
            return Ok(None);
        }
        state.human_reviewed = true;

        self.transition(state, ChunkStatus::AwaitingReview, None)
            .await?;
        self.emit(state, EventKind::ReviewRequired, None).await;
        let input = state.stage_input(self.order.reviewer(), &self.order, self.continuity.as_ref());
        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReelError::Cancelled),
            verdict = gate.review(&input) => verdict?,
        };

        if verdict.is_approve() {
            info!("human review approved");
            self.emit(state, EventKind::HumanApproved, None).await;
            self.transition(state, ChunkStatus::Running, None).await?;
            return Ok(None);
        }

        info!("human review requested a revision");
        let feedback = verdict.feedback().map(str::to_owned);
        let decision = self.router.route(state, verdict)?;
        Ok(Some((decision, feedback)))
    }

    /// Applies a routing decision.
    ///
    /// Returns the position to resume from, or `None` once the chunk is
    /// completed.
    async fn settle(
        &self,
        state: &mut WorkflowState,
        decision: RouteDecision,
        feedback: Option<String>,
    ) -> Result<Option<usize>> {
        match decision {
            RouteDecision::Terminate { forced } => {
                let kind = if forced {
                    EventKind::ForcedApproval
                } else {
                    EventKind::Approved
                };
                let summary = forced.then(|| {
                    format!(
                        "revision budget of {} exhausted",
                        self.router.max_revisions()
                    )
                });
                self.emit(state, kind, summary).await;
                self.transition(state, ChunkStatus::Completed, None).await?;
                info!(
                    revisions = state.revision_count,
                    forced = state.forced_approval,
                    "chunk completed"
                );
                Ok(None)
            }
            RouteDecision::ReenterAt(target) => {
                self.emit(state, EventKind::RevisionRequested { target }, feedback.clone())
                    .await;
                self.transition(state, ChunkStatus::Revising, feedback)
                    .await?;
                let start = self
                    .order
                    .position(target)
                    .ok_or_else(|| ReelError::StageNotFound(target.to_string()))?;
                self.transition(state, ChunkStatus::Running, None).await?;
                Ok(Some(start))
            }
        }
    }

    fn decode_verdict(&self, state: &WorkflowState, attempts: u32) -> Result<ReviewVerdict> {
        let reviewer = self.order.reviewer();
        let output = state.stage_outputs.get(reviewer).ok_or_else(|| {
            ReelError::StageFailure {
                stage: reviewer,
                attempts,
                source: StageError::Malformed("reviewer produced no output".to_string()),
            }
        })?;

        ReviewVerdict::from_payload(&output.payload, &self.order).map_err(|e| match e {
            ReelError::StageFailure { stage, source, .. } => ReelError::StageFailure {
                stage,
                attempts,
                source,
            },
            other => other,
        })
    }

    /// Invokes `stage` with timeout, retry and backoff.
    ///
    /// Returns the accepted output and the number of attempts it took.
    async fn invoke(
        &self,
        state: &WorkflowState,
        stage: StageId,
        cancel: &CancellationToken,
    ) -> Result<(StageOutput, u32)> {
        let executor = self
            .stages
            .get(&stage)
            .ok_or_else(|| ReelError::StageNotFound(stage.to_string()))?;
        let policy = self.config.policy(stage);
        let timeout = policy.timeout();
        let input = state.stage_input(stage, &self.order, self.continuity.as_ref());
        let feedback = state.feedback_for(stage).map(str::to_owned);
        let span = info_span!("stage", stage = %stage);

        async {
            info!(revision = input.revision, feedback = feedback.is_some(), "executing stage");
            self.emit(state, EventKind::StageStarted, None).await;

            let mut delays = policy.backoff();
            let mut attempt = 1;
            loop {
                let call = tokio::time::timeout(timeout, executor.execute(&input, feedback.as_deref()));
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReelError::Cancelled),
                    result = call => result.unwrap_or(Err(StageError::Timeout(timeout))),
                };

                let error = match result {
                    Ok(output) => {
                        info!(attempt, "stage completed");
                        self.emit(state, EventKind::StageCompleted, output.summary.clone())
                            .await;
                        return Ok((output, attempt));
                    }
                    Err(e) => e,
                };

                let delay = if error.is_retryable() { delays.next() } else { None };
                let Some(delay) = delay else {
                    warn!(attempt, error = %error, "stage failed");
                    return Err(ReelError::StageFailure {
                        stage,
                        attempts: attempt,
                        source: error,
                    });
                };

                warn!(
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "stage failed, retrying"
                );
                attempt += 1;
                self.emit(
                    state,
                    EventKind::StageRetried { attempt },
                    Some(error.to_string()),
                )
                .await;

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReelError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn transition(
        &self,
        state: &mut WorkflowState,
        next: ChunkStatus,
        summary: Option<String>,
    ) -> Result<()> {
        let from = state.status;
        state.transition_to(next)?;
        debug!(from = %from, to = %next, "chunk transition");
        self.emit(state, EventKind::StatusChanged, summary).await;
        Ok(())
    }

    async fn emit(&self, state: &WorkflowState, kind: EventKind, summary: Option<String>) {
        let mut event = ProgressEvent::new(state.chunk_id, state.status, kind)
            .with_stage(state.current_stage);
        event.summary = summary;
        self.reporter.report(event).await;
    }

    async fn archive(&self, run_id: Uuid, state: &WorkflowState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_chunk_state(run_id, state).await {
            warn!(chunk_id = state.chunk_id, error = %e, "failed to archive chunk state");
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("order", &self.order.stages())
            .field("config", &self.config)
            .field("reporter", &self.reporter)
            .field("store", &self.store.is_some())
            .field("gate", &self.gate.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for constructing a [`Workflow`].
pub struct WorkflowBuilder {
    stages: HashMap<StageId, Arc<dyn Stage>>,
    config: PipelineConfig,
    sinks: Vec<Arc<dyn ProgressSink>>,
    store: Option<Arc<dyn StateStore>>,
    gate: Option<Arc<dyn ReviewGate>>,
    continuity: Option<Value>,
}

impl WorkflowBuilder {
    /// Creates a new builder with the default configuration.
    fn new() -> Self {
        Self {
            stages: HashMap::new(),
            config: PipelineConfig::default(),
            sinks: Vec::new(),
            store: None,
            gate: None,
            continuity: None,
        }
    }

    /// Registers a stage under its own [`Stage::id`].
    ///
    /// # Panics
    ///
    /// Panics if a stage with the same id is already registered. Use
    /// [`try_stage`](Self::try_stage) for a fallible version.
    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        let id = stage.id();
        match self.try_stage(stage) {
            Ok(builder) => builder,
            Err(_) => panic!("duplicate stage: {}", id),
        }
    }

    /// Registers a stage, returning an error on duplicate.
    ///
    /// This is the fallible version of [`stage`](Self::stage).
    pub fn try_stage(self, stage: impl Stage + 'static) -> Result<Self> {
        self.try_stage_arc(Arc::new(stage))
    }

    /// Registers a shared stage, returning an error on duplicate.
    pub fn try_stage_arc(mut self, stage: Arc<dyn Stage>) -> Result<Self> {
        let id = stage.id();
        if self.stages.contains_key(&id) {
            return Err(ReelError::DuplicateStage(id));
        }
        self.stages.insert(id, stage);
        Ok(self)
    }

    /// Sets the configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a progress sink.
    pub fn sink(self, sink: impl ProgressSink + 'static) -> Self {
        self.sink_arc(Arc::new(sink))
    }

    /// Attaches a shared progress sink.
    pub fn sink_arc(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Archives terminal chunk states in `store`.
    pub fn store(self, store: impl StateStore + 'static) -> Self {
        self.store_arc(Arc::new(store))
    }

    /// Archives terminal chunk states in a shared store.
    pub fn store_arc(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Consults `gate` once per chunk before the reviewer stage.
    ///
    /// See [`ReviewGate`] for when the gate is skipped.
    pub fn review_gate(self, gate: impl ReviewGate + 'static) -> Self {
        self.review_gate_arc(Arc::new(gate))
    }

    /// Consults a shared gate once per chunk before the reviewer stage.
    pub fn review_gate_arc(mut self, gate: Arc<dyn ReviewGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the continuity context handed unchanged to every stage call.
    pub fn continuity(mut self, continuity: Value) -> Self {
        self.continuity = Some(continuity);
        self
    }

    /// Builds the workflow, validating configuration and registration.
    ///
    /// # Errors
    ///
    /// - [`ReelError::Configuration`] if the configuration is invalid
    /// - [`ReelError::StageNotFound`] if a stage in `stage_order` has no
    ///   registered implementation
    pub fn build(self) -> Result<Workflow> {
        self.config.validate()?;
        let order = StageOrder::new(&self.config.stage_order)?;

        if let Some(missing) = order.stages().iter().find(|id| !self.stages.contains_key(id)) {
            return Err(ReelError::StageNotFound(missing.to_string()));
        }
        for id in self.stages.keys().filter(|id| !order.contains(**id)) {
            warn!(stage = %id, "stage registered but not in stage_order; it will not run");
        }

        let events = BroadcastSink::new();
        let mut reporter = ProgressReporter::new(self.config.reporter_timeout());
        reporter.add_sink(Arc::new(events.clone()));
        for sink in self.sinks {
            reporter.add_sink(sink);
        }

        Ok(Workflow {
            router: RevisionRouter::new(order.clone(), self.config.max_revisions),
            stages: self.stages,
            order,
            config: self.config,
            reporter,
            events,
            store: self.store,
            gate: self.gate,
            continuity: self.continuity,
        })
    }
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
