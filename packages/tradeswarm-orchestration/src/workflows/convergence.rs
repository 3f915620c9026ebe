//! Two-party iterative refinement
//!
//! Each round calls party A with the upstream inputs and B's latest position,
//! then party B with the same inputs and A's new position. An injected
//! [`ConvergenceComparator`] decides after every round whether the parties
//! have converged. The round cap is enforced here, outside the comparator, so
//! no comparator can keep the loop running.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use tradeswarm_storage::OutputKind;

use crate::config::{ComparatorKind, ConvergenceConfig};
use crate::error::Result;
use crate::gate::GateOptions;
use crate::pipeline::{
    DegradedPolicy, InputRequirement, Pipeline, PipelineContext, PipelineInputs,
};
use crate::worker::{SharedWorker, WorkerInput};

/// Positions seen so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    /// Completed rounds
    pub iteration: u32,
    pub last_position_a: Option<Value>,
    pub last_position_b: Option<Value>,
    pub previous_position_a: Option<Value>,
    pub previous_position_b: Option<Value>,
    /// Comparator-defined distance between the parties, if it computes one
    pub delta_metric: Option<f64>,
}

impl ConvergenceState {
    fn record_round(&mut self, a: Value, b: Value) {
        self.iteration += 1;
        self.previous_position_a = self.last_position_a.replace(a);
        self.previous_position_b = self.last_position_b.replace(b);
    }
}

/// Comparator verdict after a round
#[derive(Debug, Clone, PartialEq)]
pub enum ConvergenceSignal {
    Continue(ConvergenceState),
    /// Final payload to persist
    Converged(Value),
}

/// `{ iterations, converged, party_a, party_b, delta_metric }`
pub fn standard_report(state: &ConvergenceState, converged: bool) -> Value {
    json!({
        "iterations": state.iteration,
        "converged": converged,
        "party_a": state.last_position_a.clone().unwrap_or(Value::Null),
        "party_b": state.last_position_b.clone().unwrap_or(Value::Null),
        "delta_metric": state.delta_metric,
    })
}

/// Pluggable convergence policy
pub trait ConvergenceComparator: Send + Sync {
    fn assess(&self, state: ConvergenceState) -> ConvergenceSignal;

    /// Output when the round cap is reached without convergence
    fn tie_break(&self, state: ConvergenceState) -> Value {
        standard_report(&state, false)
    }
}

fn field_f64(position: Option<&Value>, field: &str) -> Option<f64> {
    position.and_then(|p| p.get(field)).and_then(Value::as_f64)
}

/// Converged once both confidences are within `threshold`, from round 2 on
#[derive(Debug, Clone)]
pub struct ConfidenceGapComparator {
    pub field: String,
    pub threshold: f64,
}

impl ConfidenceGapComparator {
    pub fn new(field: impl Into<String>, threshold: f64) -> Self {
        Self {
            field: field.into(),
            threshold,
        }
    }
}

impl Default for ConfidenceGapComparator {
    fn default() -> Self {
        Self::new("confidence", 0.1)
    }
}

impl ConvergenceComparator for ConfidenceGapComparator {
    fn assess(&self, mut state: ConvergenceState) -> ConvergenceSignal {
        let a = field_f64(state.last_position_a.as_ref(), &self.field);
        let b = field_f64(state.last_position_b.as_ref(), &self.field);

        state.delta_metric = match (a, b) {
            (Some(a), Some(b)) => Some((a - b).abs()),
            _ => None,
        };

        match state.delta_metric {
            Some(gap) if state.iteration >= 2 && gap < self.threshold => {
                ConvergenceSignal::Converged(standard_report(&state, true))
            }
            _ => ConvergenceSignal::Continue(state),
        }
    }
}

/// Converged once neither party moved since the previous round
///
/// Compares `field` of each position, or the whole payload when unset.
#[derive(Debug, Clone, Default)]
pub struct StablePositionComparator {
    pub field: Option<String>,
}

impl StablePositionComparator {
    pub fn on_field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
        }
    }

    fn position<'a>(&self, payload: Option<&'a Value>) -> Option<&'a Value> {
        match &self.field {
            Some(field) => payload.and_then(|p| p.get(field.as_str())),
            None => payload,
        }
    }

    fn moved(&self, previous: Option<&Value>, last: Option<&Value>) -> bool {
        match (self.position(previous), self.position(last)) {
            (Some(prev), Some(last)) => prev != last,
            _ => true,
        }
    }
}

impl ConvergenceComparator for StablePositionComparator {
    fn assess(&self, mut state: ConvergenceState) -> ConvergenceSignal {
        let moved_a = self.moved(
            state.previous_position_a.as_ref(),
            state.last_position_a.as_ref(),
        );
        let moved_b = self.moved(
            state.previous_position_b.as_ref(),
            state.last_position_b.as_ref(),
        );
        let moved = u8::from(moved_a) + u8::from(moved_b);
        state.delta_metric = Some(f64::from(moved));

        if moved == 0 {
            ConvergenceSignal::Converged(standard_report(&state, true))
        } else {
            ConvergenceSignal::Continue(state)
        }
    }
}

pub fn comparator_from_config(config: &ConvergenceConfig) -> Arc<dyn ConvergenceComparator> {
    match config.comparator {
        ComparatorKind::ConfidenceGap => Arc::new(ConfidenceGapComparator::new(
            config.confidence_field.clone(),
            config.confidence_threshold,
        )),
        ComparatorKind::StablePosition => Arc::new(StablePositionComparator {
            field: config.position_field.clone(),
        }),
    }
}

/// Convergence pipeline (research debate by default)
pub struct ConvergenceWorkflow {
    output_kind: OutputKind,
    producer_id: String,
    requirement: InputRequirement,
    party_a: SharedWorker,
    party_b: SharedWorker,
    comparator: Arc<dyn ConvergenceComparator>,
    max_iterations: u32,
}

impl ConvergenceWorkflow {
    pub fn new(
        party_a: SharedWorker,
        party_b: SharedWorker,
        comparator: Arc<dyn ConvergenceComparator>,
    ) -> Self {
        Self {
            output_kind: OutputKind::ResearchReport,
            producer_id: "research_convergence".to_string(),
            requirement: InputRequirement::all_of(OutputKind::leaf_kinds()),
            party_a,
            party_b,
            comparator,
            max_iterations: ConvergenceConfig::default().max_iterations,
        }
    }

    /// Comparator and round cap taken from configuration
    pub fn from_config(
        party_a: SharedWorker,
        party_b: SharedWorker,
        config: &ConvergenceConfig,
    ) -> Self {
        Self::new(party_a, party_b, comparator_from_config(config))
            .with_max_iterations(config.max_iterations)
    }

    pub fn with_output_kind(mut self, kind: OutputKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn with_producer_id(mut self, producer_id: impl Into<String>) -> Self {
        self.producer_id = producer_id.into();
        self
    }

    pub fn with_upstream(mut self, kinds: impl IntoIterator<Item = OutputKind>) -> Self {
        self.requirement.kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_policy(mut self, policy: DegradedPolicy) -> Self {
        self.requirement.on_timeout = policy;
        self
    }

    pub fn with_gate(mut self, gate: GateOptions) -> Self {
        self.requirement.gate = gate;
        self
    }

    /// At least one round always runs
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    fn party_input(
        &self,
        ctx: &PipelineContext,
        upstream: &BTreeMap<OutputKind, Value>,
        round: u32,
        peer: Option<&Value>,
    ) -> WorkerInput {
        WorkerInput::new(ctx.session_id.clone())
            .with_upstream(upstream.clone())
            .with_context("iteration", round)
            .with_context("peer_position", peer.cloned().unwrap_or(Value::Null))
    }

    /// Alternate the parties until the comparator converges or the cap is hit
    pub async fn run_rounds(
        &self,
        ctx: &PipelineContext,
        upstream: &BTreeMap<OutputKind, Value>,
    ) -> Result<Value> {
        let mut state = ConvergenceState::default();
        let mut round: u32 = 0;

        loop {
            round += 1;

            let input_a = self.party_input(ctx, upstream, round, state.last_position_b.as_ref());
            let a = ctx
                .call_worker("convergence.party_a", self.party_a.as_ref(), input_a)
                .await?;

            let input_b = self.party_input(ctx, upstream, round, Some(&a));
            let b = ctx
                .call_worker("convergence.party_b", self.party_b.as_ref(), input_b)
                .await?;

            state.record_round(a, b);
            debug!(round, "convergence round complete");

            match self.comparator.assess(state) {
                ConvergenceSignal::Converged(output) => {
                    info!(rounds = round, "parties converged");
                    return Ok(output);
                }
                ConvergenceSignal::Continue(next) => {
                    state = next;
                    if round >= self.max_iterations {
                        info!(rounds = round, "round cap reached without convergence");
                        return Ok(self.comparator.tie_break(state));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Pipeline for ConvergenceWorkflow {
    fn output_kind(&self) -> OutputKind {
        self.output_kind
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn requirement(&self) -> Option<&InputRequirement> {
        Some(&self.requirement)
    }

    async fn execute(&self, ctx: &PipelineContext, inputs: PipelineInputs) -> Result<Value> {
        self.run_rounds(ctx, &inputs.upstream).await
    }
}
