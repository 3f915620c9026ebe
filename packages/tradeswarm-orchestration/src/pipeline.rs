//! Pipeline lifecycle
//!
//! ```text
//! WaitingForInputs ──► Executing ──► Persisting ──► Completed | Degraded
//!        │                 │              │
//!        └─────────────────┴──────────────┴──► Failed | Cancelled
//! ```
//!
//! Leaf pipelines start in `Executing`. Dependent pipelines wait on the
//! readiness gate first and fall back according to their [`DegradedPolicy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use tradeswarm_storage::{Ack, CoordinationStore, OutputKind, OutputRecord, SessionId};

use crate::dispatcher::TaskDispatcher;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::gate::{GateOptions, ReadinessGate, SessionSnapshot};
use crate::worker::{SharedWorker, Worker, WorkerInput};

// ═══════════════════════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    WaitingForInputs,
    Executing,
    Persisting,
    Completed,
    Degraded,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::WaitingForInputs => "waiting_for_inputs",
            PipelineState::Executing => "executing",
            PipelineState::Persisting => "persisting",
            PipelineState::Completed => "completed",
            PipelineState::Degraded => "degraded",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed
                | PipelineState::Degraded
                | PipelineState::Failed
                | PipelineState::Cancelled
        )
    }

    fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (WaitingForInputs, Executing) => true,
            (Executing, Persisting) => true,
            (Persisting, Completed) | (Persisting, Degraded) => true,
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome reported for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Degraded,
    Failed,
    Cancelled,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Completed => "completed",
            TerminalState::Degraded => "degraded",
            TerminalState::Failed => "failed",
            TerminalState::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == TerminalState::Completed
    }

    pub fn from_state(state: PipelineState) -> Option<Self> {
        match state {
            PipelineState::Completed => Some(TerminalState::Completed),
            PipelineState::Degraded => Some(TerminalState::Degraded),
            PipelineState::Failed => Some(TerminalState::Failed),
            PipelineState::Cancelled => Some(TerminalState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: PipelineState,
    pub at: DateTime<Utc>,
}

/// Validated lifecycle transitions with history
#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    state: PipelineState,
    degraded: bool,
    history: Vec<StateTransition>,
}

impl PipelineStateMachine {
    fn starting_at(state: PipelineState) -> Self {
        Self {
            state,
            degraded: false,
            history: vec![StateTransition {
                state,
                at: Utc::now(),
            }],
        }
    }

    /// No dependencies: straight to `Executing`
    pub fn for_leaf() -> Self {
        Self::starting_at(PipelineState::Executing)
    }

    pub fn for_dependent() -> Self {
        Self::starting_at(PipelineState::WaitingForInputs)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn states(&self) -> Vec<PipelineState> {
        self.history.iter().map(|t| t.state).collect()
    }

    fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.state = next;
        self.history.push(StateTransition {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Transition: WAITING_FOR_INPUTS → EXECUTING
    pub fn inputs_acquired(&mut self, degraded: bool) -> Result<()> {
        self.transition(PipelineState::Executing)?;
        self.degraded = degraded;
        Ok(())
    }

    /// Transition: EXECUTING → PERSISTING
    pub fn begin_persisting(&mut self) -> Result<()> {
        self.transition(PipelineState::Persisting)
    }

    /// Transition: PERSISTING → COMPLETED, or DEGRADED when inputs were partial
    pub fn persisted(&mut self) -> Result<()> {
        if self.degraded {
            self.transition(PipelineState::Degraded)
        } else {
            self.transition(PipelineState::Completed)
        }
    }

    /// Transition: any non-terminal → FAILED
    pub fn fail(&mut self) -> Result<()> {
        self.transition(PipelineState::Failed)
    }

    /// Transition: any non-terminal → CANCELLED
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(PipelineState::Cancelled)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════════════════════════════════════

/// What a dependent pipeline does when its inputs are incomplete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Fail the pipeline
    Abort,
    /// Run on the complete subset; fails if that subset is empty
    ProceedWithAvailable,
}

/// Upstream kinds a pipeline waits for, and how
#[derive(Debug, Clone, PartialEq)]
pub struct InputRequirement {
    pub kinds: Vec<OutputKind>,
    pub on_timeout: DegradedPolicy,
    pub gate: GateOptions,
}

impl InputRequirement {
    pub fn all_of(kinds: impl IntoIterator<Item = OutputKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            on_timeout: DegradedPolicy::Abort,
            gate: GateOptions::default(),
        }
    }

    pub fn with_policy(mut self, policy: DegradedPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    pub fn with_gate(mut self, gate: GateOptions) -> Self {
        self.gate = gate;
        self
    }

    /// Turn the gate's view into inputs, applying the degraded policy
    fn resolve(&self, snapshot: &SessionSnapshot, timed_out: bool) -> Result<PipelineInputs> {
        let missing = snapshot.missing(&self.kinds);
        let upstream = snapshot.payloads_for(&self.kinds);

        if missing.is_empty() {
            return Ok(PipelineInputs {
                upstream,
                missing,
                degraded: false,
            });
        }

        let reason = if timed_out {
            "timed out waiting"
        } else {
            "upstream failed"
        };
        let missing_names = missing
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        match self.on_timeout {
            DegradedPolicy::ProceedWithAvailable if !upstream.is_empty() => {
                warn!(missing = %missing_names, reason, "proceeding with partial inputs");
                Ok(PipelineInputs {
                    upstream,
                    missing,
                    degraded: true,
                })
            }
            _ => Err(OrchestratorError::MissingDependency(format!(
                "{}: {}",
                reason, missing_names
            ))),
        }
    }
}

/// Inputs handed to [`Pipeline::execute`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineInputs {
    /// Complete upstream payloads
    pub upstream: BTreeMap<OutputKind, Value>,
    /// Required kinds that were not available
    pub missing: Vec<OutputKind>,
    pub degraded: bool,
}

impl PipelineInputs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: OutputKind) -> Option<&Value> {
        self.upstream.get(&kind)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pipeline trait
// ═══════════════════════════════════════════════════════════════════════════

/// Handles shared by every pipeline of a session
#[derive(Clone)]
pub struct PipelineContext {
    pub session_id: SessionId,
    pub store: Arc<dyn CoordinationStore>,
    pub gate: ReadinessGate,
    pub dispatcher: Arc<TaskDispatcher>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn CoordinationStore>,
        dispatcher: Arc<TaskDispatcher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            gate: ReadinessGate::new(Arc::clone(&store)),
            store,
            dispatcher,
            cancel,
        }
    }

    /// Invoke a worker through the dispatcher, honoring session cancellation
    pub async fn call_worker(
        &self,
        label: &str,
        worker: &dyn Worker,
        input: WorkerInput,
    ) -> Result<Value> {
        self.dispatcher
            .run_cancellable(label, &self.cancel, || worker.execute(input.clone()))
            .await
    }
}

/// One schedulable unit producing exactly one output kind per session
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn output_kind(&self) -> OutputKind;

    fn producer_id(&self) -> &str;

    /// Upstream inputs to wait for; `None` for leaf pipelines
    fn requirement(&self) -> Option<&InputRequirement> {
        None
    }

    /// Produce the output payload
    async fn execute(&self, ctx: &PipelineContext, inputs: PipelineInputs) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════

/// Terminal report for one pipeline instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub output_kind: OutputKind,
    pub producer_id: String,
    pub state: TerminalState,
    /// Sequence number of the persisted complete record
    pub sequence_no: Option<i64>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub missing_inputs: Vec<OutputKind>,
    pub duration_ms: u64,
    pub history: Vec<PipelineState>,
}

impl PipelineOutcome {
    /// Outcome for a pipeline task that panicked before reporting
    pub fn panicked(
        output_kind: OutputKind,
        producer_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            output_kind,
            producer_id: producer_id.into(),
            state: TerminalState::Failed,
            sequence_no: None,
            error: Some(message.into()),
            error_category: Some(ErrorCategory::Infrastructure),
            missing_inputs: Vec::new(),
            duration_ms: 0,
            history: vec![PipelineState::Failed],
        }
    }
}

/// Drives one pipeline through its lifecycle
///
/// Never returns an error: every failure becomes a `Failed` (or `Cancelled`)
/// outcome.
pub struct PipelineRunner;

impl PipelineRunner {
    pub async fn run(pipeline: &dyn Pipeline, ctx: &PipelineContext) -> PipelineOutcome {
        let span = tracing::info_span!(
            "pipeline",
            session_id = %ctx.session_id,
            output_kind = %pipeline.output_kind(),
        );
        Self::run_inner(pipeline, ctx).instrument(span).await
    }

    async fn run_inner(pipeline: &dyn Pipeline, ctx: &PipelineContext) -> PipelineOutcome {
        let started = Instant::now();
        let kind = pipeline.output_kind();
        let producer_id = pipeline.producer_id().to_string();

        let mut machine = match pipeline.requirement() {
            Some(_) => PipelineStateMachine::for_dependent(),
            None => PipelineStateMachine::for_leaf(),
        };
        let mut missing = Vec::new();

        let result = Self::drive(pipeline, ctx, &mut machine, &mut missing).await;

        let (sequence_no, error, error_category) = match result {
            Ok(ack) => {
                info!(
                    state = %machine.state(),
                    sequence_no = ?ack.sequence_no,
                    "pipeline finished"
                );
                (ack.sequence_no, None, None)
            }
            Err(e) if e.is_cancelled() || ctx.cancel.is_cancelled() => {
                settle(&mut machine, PipelineState::Cancelled);
                info!(reason = %e, "pipeline cancelled");
                (None, Some(e.to_string()), None)
            }
            Err(e) => {
                settle(&mut machine, PipelineState::Failed);
                error!(error = %e, "pipeline failed");
                Self::record_failure(ctx, kind, &producer_id, &e).await;
                (None, Some(e.to_string()), Some(e.category()))
            }
        };

        PipelineOutcome {
            output_kind: kind,
            producer_id,
            state: TerminalState::from_state(machine.state()).unwrap_or(TerminalState::Failed),
            sequence_no,
            error,
            error_category,
            missing_inputs: missing,
            duration_ms: started.elapsed().as_millis() as u64,
            history: machine.states(),
        }
    }

    async fn drive(
        pipeline: &dyn Pipeline,
        ctx: &PipelineContext,
        machine: &mut PipelineStateMachine,
        missing: &mut Vec<OutputKind>,
    ) -> Result<Ack> {
        let kind = pipeline.output_kind();
        let producer_id = pipeline.producer_id();

        // WaitingForInputs
        let inputs = match pipeline.requirement() {
            None => PipelineInputs::empty(),
            Some(requirement) => {
                let inputs = Self::acquire_inputs(requirement, ctx).await;
                if let Err(OrchestratorError::MissingDependency(_)) = &inputs {
                    let snapshot = ctx.gate.snapshot(&ctx.session_id).await;
                    *missing = snapshot.missing(&requirement.kinds);
                }
                let inputs = inputs?;
                *missing = inputs.missing.clone();
                machine.inputs_acquired(inputs.degraded)?;
                inputs
            }
        };

        // Executing
        if ctx.cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("not started"));
        }
        ctx.store
            .submit(OutputRecord::pending(ctx.session_id.clone(), kind, producer_id))
            .await?;
        debug!(degraded = inputs.degraded, "executing");

        let payload = pipeline.execute(ctx, inputs).await?;
        if ctx.cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("result discarded"));
        }

        // Persisting
        machine.begin_persisting()?;
        let ack = ctx
            .store
            .submit(OutputRecord::complete(
                ctx.session_id.clone(),
                kind,
                producer_id,
                payload,
            ))
            .await?;
        machine.persisted()?;
        Ok(ack)
    }

    async fn acquire_inputs(
        requirement: &InputRequirement,
        ctx: &PipelineContext,
    ) -> Result<PipelineInputs> {
        let waited = ctx
            .gate
            .await_kinds(&ctx.session_id, &requirement.kinds, &requirement.gate, &ctx.cancel)
            .await;

        match waited {
            Ok(snapshot) => requirement.resolve(&snapshot, false),
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "readiness deadline passed");
                let snapshot = ctx.gate.snapshot(&ctx.session_id).await;
                requirement.resolve(&snapshot, true)
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort failure record so downstream gates resolve early
    async fn record_failure(
        ctx: &PipelineContext,
        kind: OutputKind,
        producer_id: &str,
        cause: &OrchestratorError,
    ) {
        let record =
            OutputRecord::failed(ctx.session_id.clone(), kind, producer_id, cause.to_string());
        if let Err(e) = ctx.store.submit(record).await {
            debug!(error = %e, "failure record not written");
        }
    }
}

/// Move to `target` after an error; a machine that already settled keeps its state
fn settle(machine: &mut PipelineStateMachine, target: PipelineState) {
    let moved = match target {
        PipelineState::Cancelled => machine.cancel(),
        _ => machine.fail(),
    };
    if let Err(e) = moved {
        warn!(error = %e, state = %machine.state(), "pipeline state left unchanged");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Leaf pipeline
// ═══════════════════════════════════════════════════════════════════════════

/// Pipeline without dependencies: one worker call, one record
pub struct LeafPipeline {
    kind: OutputKind,
    worker: SharedWorker,
    params: Value,
}

impl LeafPipeline {
    pub fn new(kind: OutputKind, worker: SharedWorker) -> Self {
        Self {
            kind,
            worker,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
impl Pipeline for LeafPipeline {
    fn output_kind(&self) -> OutputKind {
        self.kind
    }

    fn producer_id(&self) -> &str {
        self.worker.producer_id()
    }

    async fn execute(&self, ctx: &PipelineContext, _inputs: PipelineInputs) -> Result<Value> {
        let input = WorkerInput::new(ctx.session_id.clone()).with_params(self.params.clone());
        ctx.call_worker(self.kind.as_str(), self.worker.as_ref(), input)
            .await
    }
}
