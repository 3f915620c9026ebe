//! Session launcher
//!
//! Starts every pipeline of a session at once and waits for all of them.
//! Pipelines coordinate only through the store, so the launcher needs no
//! phase ordering; the phases from [`PipelineSet`] are logged for operators.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tradeswarm_storage::{
    CoordinationStore, OutputKind, OutputRecord, Session, SessionId, SessionStatus,
};

use crate::dag::PipelineSet;
use crate::dispatcher::TaskDispatcher;
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineContext, PipelineOutcome, PipelineRunner, TerminalState};

/// Aggregate result of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub outcomes: BTreeMap<OutputKind, PipelineOutcome>,
    pub duration_ms: u64,
}

impl SessionReport {
    /// `output_kind -> terminal state`
    pub fn terminal_states(&self) -> BTreeMap<OutputKind, TerminalState> {
        self.outcomes
            .iter()
            .map(|(kind, outcome)| (*kind, outcome.state))
            .collect()
    }

    /// Every pipeline completed without degradation
    pub fn is_successful(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| o.state.is_success())
    }

    pub fn decision_outcome(&self, kind: OutputKind) -> Option<TerminalState> {
        self.outcomes.get(&kind).map(|o| o.state)
    }

    pub fn failed_kinds(&self) -> Vec<OutputKind> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.state == TerminalState::Failed)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn session_status(
    outcomes: &BTreeMap<OutputKind, PipelineOutcome>,
    cancelled: bool,
) -> SessionStatus {
    if cancelled {
        SessionStatus::Cancelled
    } else if outcomes.values().any(|o| o.state == TerminalState::Failed) {
        SessionStatus::Failed
    } else {
        SessionStatus::Completed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "pipeline panicked".to_string()
    }
}

/// Runs sessions against a shared store and dispatcher
#[derive(Clone)]
pub struct SessionLauncher {
    store: Arc<dyn CoordinationStore>,
    dispatcher: Arc<TaskDispatcher>,
}

impl SessionLauncher {
    pub fn new(store: Arc<dyn CoordinationStore>, dispatcher: Arc<TaskDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub async fn run_session(
        &self,
        session_id: SessionId,
        pipelines: Vec<Arc<dyn Pipeline>>,
    ) -> Result<SessionReport> {
        self.run_session_with_cancel(session_id, pipelines, CancellationToken::new())
            .await
    }

    /// Run every pipeline to a terminal state
    ///
    /// Errors only when the pipeline set is invalid or the session row cannot
    /// be created. Pipeline failures, panics and cancellation are reported in
    /// the returned [`SessionReport`].
    pub async fn run_session_with_cancel(
        &self,
        session_id: SessionId,
        pipelines: Vec<Arc<dyn Pipeline>>,
        cancel: CancellationToken,
    ) -> Result<SessionReport> {
        let started = Instant::now();
        let set = PipelineSet::new(pipelines)?;

        info!(
            session_id = %session_id,
            pipelines = set.len(),
            "starting session\n{}",
            set.execution_plan()
        );

        self.store
            .create_session(Session::new(session_id.clone()))
            .await?;

        let ctx = PipelineContext::new(
            session_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
            cancel.clone(),
        );

        let mut kinds = Vec::with_capacity(set.len());
        let mut tasks = Vec::with_capacity(set.len());
        for pipeline in set.pipelines() {
            let pipeline = Arc::clone(pipeline);
            let ctx = ctx.clone();
            kinds.push((pipeline.output_kind(), pipeline.producer_id().to_string()));
            tasks.push(tokio::spawn(Self::supervise(pipeline, ctx)));
        }

        let results = futures::future::join_all(tasks).await;

        let mut outcomes = BTreeMap::new();
        for ((kind, producer_id), task_result) in kinds.into_iter().zip(results) {
            let outcome = match task_result {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(
                        session_id = %session_id,
                        output_kind = %kind,
                        error = %join_err,
                        "pipeline task lost"
                    );
                    PipelineOutcome::panicked(kind, producer_id, join_err.to_string())
                }
            };
            outcomes.insert(kind, outcome);
        }

        let status = session_status(&outcomes, cancel.is_cancelled());
        if let Err(e) = self.store.finish_session(&session_id, status).await {
            warn!(session_id = %session_id, error = %e, "could not record session status");
        }

        let report = SessionReport {
            session_id,
            status,
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            session_id = %report.session_id,
            status = %report.status,
            failed = report.failed_kinds().len(),
            duration_ms = report.duration_ms,
            "session finished"
        );

        Ok(report)
    }

    /// Run one pipeline, turning a panic into a failed outcome and record
    async fn supervise(pipeline: Arc<dyn Pipeline>, ctx: PipelineContext) -> PipelineOutcome {
        let run = AssertUnwindSafe(PipelineRunner::run(pipeline.as_ref(), &ctx)).catch_unwind();

        match run.await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let kind = pipeline.output_kind();
                error!(
                    session_id = %ctx.session_id,
                    output_kind = %kind,
                    panic = %message,
                    "pipeline panicked"
                );

                let record = OutputRecord::failed(
                    ctx.session_id.clone(),
                    kind,
                    pipeline.producer_id(),
                    message.clone(),
                );
                if let Err(e) = ctx.store.submit(record).await {
                    warn!(error = %e, "failure record not written");
                }
                PipelineOutcome::panicked(kind, pipeline.producer_id(), message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::error::OrchestratorError;
    use crate::pipeline::{LeafPipeline, PipelineInputs, PipelineState};
    use crate::worker::{FnWorker, WorkerInput};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tradeswarm_storage::MemoryCoordinationStore;

    fn launcher(store: Arc<MemoryCoordinationStore>) -> SessionLauncher {
        SessionLauncher::new(store, Arc::new(TaskDispatcher::new(DispatcherConfig::default())))
    }

    fn leaf(kind: OutputKind) -> Arc<dyn Pipeline> {
        Arc::new(LeafPipeline::new(
            kind,
            FnWorker::shared(kind.as_str(), move |_input: WorkerInput| async move {
                Ok(json!({"kind": kind}))
            }),
        ))
    }

    struct Exploding;

    #[async_trait]
    impl Pipeline for Exploding {
        fn output_kind(&self) -> OutputKind {
            OutputKind::NewsAnalysis
        }

        fn producer_id(&self) -> &str {
            "exploding"
        }

        async fn execute(&self, _ctx: &PipelineContext, _inputs: PipelineInputs) -> Result<Value> {
            panic!("news feed parser blew up");
        }
    }

    #[tokio::test]
    async fn test_all_leaves_complete() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let pipelines = OutputKind::leaf_kinds().into_iter().map(leaf).collect();

        let report = launcher(Arc::clone(&store))
            .run_session(SessionId::from("S1"), pipelines)
            .await
            .unwrap();

        assert!(report.is_successful());
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.terminal_states().len(), 4);

        let session = store.get_session(&SessionId::from("S1")).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let pipelines = vec![
            leaf(OutputKind::MarketAnalysis),
            Arc::new(Exploding) as Arc<dyn Pipeline>,
        ];

        let report = launcher(Arc::clone(&store))
            .run_session(SessionId::from("S1"), pipelines)
            .await
            .unwrap();

        assert_eq!(
            report.decision_outcome(OutputKind::MarketAnalysis),
            Some(TerminalState::Completed)
        );
        let news = &report.outcomes[&OutputKind::NewsAnalysis];
        assert_eq!(news.state, TerminalState::Failed);
        assert_eq!(news.history, vec![PipelineState::Failed]);
        assert!(news.error.as_deref().unwrap_or_default().contains("blew up"));
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.failed_kinds(), vec![OutputKind::NewsAnalysis]);

        let record = store
            .query(&SessionId::from("S1"), OutputKind::NewsAnalysis)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.is_complete());
    }

    #[tokio::test]
    async fn test_invalid_set_is_an_error() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let result = launcher(Arc::clone(&store))
            .run_session(
                SessionId::from("S1"),
                vec![leaf(OutputKind::MarketAnalysis), leaf(OutputKind::MarketAnalysis)],
            )
            .await;

        assert!(matches!(result, Err(OrchestratorError::DuplicatePipeline(_))));
        assert!(store.get_session(&SessionId::from("S1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_id_is_an_error() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let launcher = launcher(store);
        launcher
            .run_session(SessionId::from("S1"), vec![leaf(OutputKind::MarketAnalysis)])
            .await
            .unwrap();

        let again = launcher
            .run_session(SessionId::from("S1"), vec![leaf(OutputKind::MarketAnalysis)])
            .await;
        assert!(matches!(again, Err(OrchestratorError::Storage(_))));
    }

    #[tokio::test]
    async fn test_report_json() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let report = launcher(store)
            .run_session(SessionId::from("S1"), vec![leaf(OutputKind::FundamentalsAnalysis)])
            .await
            .unwrap();

        let json: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["session_id"], "S1");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["outcomes"]["fundamentals_analysis"]["state"], "completed");
    }
}
