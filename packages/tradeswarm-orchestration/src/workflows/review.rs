//! Sequential review: proposer → reviewer → adjudicator
//!
//! Each stage sees the upstream payloads plus every earlier stage's output.
//! Stages never overlap, and any failure ends the workflow. Only the
//! adjudicator's output is returned for persistence.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;
use tradeswarm_storage::OutputKind;

use crate::error::Result;
use crate::gate::GateOptions;
use crate::pipeline::{
    DegradedPolicy, InputRequirement, Pipeline, PipelineContext, PipelineInputs,
};
use crate::worker::{SharedWorker, WorkerInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStage {
    Proposer,
    Reviewer,
    Adjudicator,
}

impl ReviewStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStage::Proposer => "review.proposer",
            ReviewStage::Reviewer => "review.reviewer",
            ReviewStage::Adjudicator => "review.adjudicator",
        }
    }
}

pub struct SequentialReviewWorkflow {
    output_kind: OutputKind,
    producer_id: String,
    requirement: InputRequirement,
    proposer: SharedWorker,
    reviewer: SharedWorker,
    adjudicator: SharedWorker,
}

impl SequentialReviewWorkflow {
    pub fn new(proposer: SharedWorker, reviewer: SharedWorker, adjudicator: SharedWorker) -> Self {
        Self {
            output_kind: OutputKind::TradingDecision,
            producer_id: "decision_review".to_string(),
            requirement: InputRequirement::all_of([OutputKind::ResearchReport]),
            proposer,
            reviewer,
            adjudicator,
        }
    }

    pub fn with_output_kind(mut self, kind: OutputKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn with_producer_id(mut self, producer_id: impl Into<String>) -> Self {
        self.producer_id = producer_id.into();
        self
    }

    pub fn with_upstream(mut self, kind: OutputKind) -> Self {
        self.requirement.kinds = vec![kind];
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

    pub async fn run_stages(
        &self,
        ctx: &PipelineContext,
        upstream: &BTreeMap<OutputKind, Value>,
    ) -> Result<Value> {
        let base = WorkerInput::new(ctx.session_id.clone()).with_upstream(upstream.clone());

        let proposal = ctx
            .call_worker(ReviewStage::Proposer.as_str(), self.proposer.as_ref(), base.clone())
            .await?;

        let review = ctx
            .call_worker(
                ReviewStage::Reviewer.as_str(),
                self.reviewer.as_ref(),
                base.clone().with_context("proposal", proposal.clone()),
            )
            .await?;

        let decision = ctx
            .call_worker(
                ReviewStage::Adjudicator.as_str(),
                self.adjudicator.as_ref(),
                base.with_context("proposal", proposal)
                    .with_context("review", review),
            )
            .await?;

        info!("decision adjudicated");
        Ok(decision)
    }
}

#[async_trait]
impl Pipeline for SequentialReviewWorkflow {
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
        self.run_stages(ctx, &inputs.upstream).await
    }
}
