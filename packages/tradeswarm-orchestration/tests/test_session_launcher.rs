//! Integration tests for full sessions
//!
//! Covers:
//! - Fault isolation (one leaf fails fatally, abort and degrade policies)
//! - Sequential review ordering inside a session
//! - Cooperative cancellation
//! - Durable sessions on SQLite

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tradeswarm_orchestration::storage::{
    CoordinationStore, MemoryCoordinationStore, OutputKind, RecordStatus, SessionId, SessionStatus,
    SqliteCoordinationStore, StoreConfig,
};
use tradeswarm_orchestration::{
    ConfidenceGapComparator, ConvergenceWorkflow, DegradedPolicy, DispatcherConfig, FnWorker,
    GateOptions, LeafPipeline, Pipeline, SequentialReviewWorkflow, SessionLauncher, SharedWorker,
    TaskDispatcher, TerminalState, WorkerError, WorkerInput,
};

fn fast_gate() -> GateOptions {
    GateOptions::new(Duration::from_millis(20), Duration::from_secs(10))
}

fn analyst(kind: OutputKind, fail: bool) -> SharedWorker {
    FnWorker::shared(kind.as_str(), move |_input: WorkerInput| async move {
        if fail {
            Err(WorkerError::fatal(format!("{} provider rejected the request", kind)))
        } else {
            Ok(json!({"kind": kind, "signal": "buy"}))
        }
    })
}

fn researcher(name: &'static str, confidence: f64) -> SharedWorker {
    FnWorker::shared(name, move |input: WorkerInput| async move {
        Ok(json!({"researcher": name, "confidence": confidence, "inputs": input.upstream.len()}))
    })
}

fn echo_stage(name: &'static str) -> SharedWorker {
    FnWorker::shared(name, move |_input: WorkerInput| async move { Ok(json!({"stage": name})) })
}

fn session_pipelines(
    failing: Option<OutputKind>,
    policy: DegradedPolicy,
) -> Vec<Arc<dyn Pipeline>> {
    let mut pipelines: Vec<Arc<dyn Pipeline>> = OutputKind::leaf_kinds()
        .into_iter()
        .map(|kind| {
            let worker = analyst(kind, failing == Some(kind));
            Arc::new(LeafPipeline::new(kind, worker)) as Arc<dyn Pipeline>
        })
        .collect();

    pipelines.push(Arc::new(
        ConvergenceWorkflow::new(
            researcher("bull", 0.62),
            researcher("bear", 0.58),
            Arc::new(ConfidenceGapComparator::default()),
        )
        .with_policy(policy)
        .with_gate(fast_gate()),
    ));
    pipelines.push(Arc::new(
        SequentialReviewWorkflow::new(
            echo_stage("trader"),
            echo_stage("risk"),
            echo_stage("manager"),
        )
        .with_gate(fast_gate()),
    ));
    pipelines
}

fn launcher(store: Arc<dyn CoordinationStore>) -> SessionLauncher {
    SessionLauncher::new(store, Arc::new(TaskDispatcher::new(DispatcherConfig::default())))
}

#[tokio::test(start_paused = true)]
async fn test_fault_isolation_with_abort_policy() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let session = SessionId::from("S1");

    let report = launcher(store.clone())
        .run_session(
            session.clone(),
            session_pipelines(Some(OutputKind::SocialAnalysis), DegradedPolicy::Abort),
        )
        .await
        .expect("launcher must not raise on pipeline failure");

    let states = report.terminal_states();
    assert_eq!(states[&OutputKind::SocialAnalysis], TerminalState::Failed);
    assert_eq!(states[&OutputKind::MarketAnalysis], TerminalState::Completed);
    assert_eq!(states[&OutputKind::NewsAnalysis], TerminalState::Completed);
    assert_eq!(states[&OutputKind::FundamentalsAnalysis], TerminalState::Completed);
    assert_eq!(states[&OutputKind::ResearchReport], TerminalState::Failed);
    assert_eq!(
        report.decision_outcome(OutputKind::TradingDecision),
        Some(TerminalState::Failed)
    );

    assert!(!report.is_successful());
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(
        report.outcomes[&OutputKind::ResearchReport].missing_inputs,
        vec![OutputKind::SocialAnalysis]
    );

    let decision = store
        .query(&session, OutputKind::TradingDecision)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(decision.status, RecordStatus::Failed, "no partial decision output");
}

#[tokio::test(start_paused = true)]
async fn test_fault_isolation_with_degraded_research() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let session = SessionId::from("S1");

    let report = launcher(store.clone())
        .run_session(
            session.clone(),
            session_pipelines(
                Some(OutputKind::SocialAnalysis),
                DegradedPolicy::ProceedWithAvailable,
            ),
        )
        .await
        .unwrap();

    let states = report.terminal_states();
    assert_eq!(states[&OutputKind::SocialAnalysis], TerminalState::Failed);
    assert_eq!(states[&OutputKind::ResearchReport], TerminalState::Degraded);
    assert_eq!(states[&OutputKind::TradingDecision], TerminalState::Completed);
    assert!(!report.is_successful());

    let research = store
        .query(&session, OutputKind::ResearchReport)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(research.status, RecordStatus::Complete);
    assert_eq!(research.payload["party_a"]["inputs"], 3);
    assert_eq!(research.payload["converged"], true);
}

#[tokio::test(start_paused = true)]
async fn test_full_session_succeeds() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let report = launcher(store.clone())
        .run_session(SessionId::from("S2"), session_pipelines(None, DegradedPolicy::Abort))
        .await
        .unwrap();

    assert!(report.is_successful());
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.outcomes.len(), 6);

    let decision = store
        .query(&SessionId::from("S2"), OutputKind::TradingDecision)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        decision.payload,
        json!({"stage": "manager"}),
        "only the adjudicator output is persisted"
    );
    assert_eq!(decision.producer_id, "decision_review");
}

#[tokio::test(start_paused = true)]
async fn test_review_stages_run_in_order() {
    let calls: Arc<Mutex<Vec<(&'static str, WorkerInput)>>> = Arc::new(Mutex::new(Vec::new()));

    let recording = |name: &'static str, output: Value| -> SharedWorker {
        let calls = Arc::clone(&calls);
        FnWorker::shared(name, move |input: WorkerInput| {
            let calls = Arc::clone(&calls);
            let output = output.clone();
            async move {
                calls.lock().push((name, input));
                Ok(output)
            }
        })
    };

    let proposal = json!({"action": "buy", "size": 100});
    let review = json!({"approved": false, "reason": "position too large"});

    let mut pipelines = session_pipelines(None, DegradedPolicy::Abort);
    pipelines.pop();
    pipelines.push(Arc::new(
        SequentialReviewWorkflow::new(
            recording("proposer", proposal.clone()),
            recording("reviewer", review.clone()),
            recording("adjudicator", json!({"action": "buy", "size": 50})),
        )
        .with_gate(fast_gate()),
    ));

    let store = Arc::new(MemoryCoordinationStore::new());
    let report = launcher(store)
        .run_session(SessionId::from("S3"), pipelines)
        .await
        .unwrap();
    assert!(report.is_successful());

    let calls = calls.lock();
    let order: Vec<_> = calls.iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!["proposer", "reviewer", "adjudicator"]);

    let reviewer_input = &calls[1].1;
    assert_eq!(reviewer_input.context_value("proposal"), Some(&proposal));
    assert!(reviewer_input.upstream_payload(OutputKind::ResearchReport).is_some());

    let adjudicator_input = &calls[2].1;
    assert_eq!(adjudicator_input.context_value("proposal"), Some(&proposal));
    assert_eq!(adjudicator_input.context_value("review"), Some(&review));
}

#[tokio::test(start_paused = true)]
async fn test_reviewer_fatal_prevents_adjudication() {
    let adjudications = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&adjudications);

    let mut pipelines = session_pipelines(None, DegradedPolicy::Abort);
    pipelines.pop();
    pipelines.push(Arc::new(
        SequentialReviewWorkflow::new(
            echo_stage("trader"),
            FnWorker::shared("risk", |_input: WorkerInput| async {
                Err(WorkerError::fatal("risk model unavailable"))
            }),
            FnWorker::shared("manager", move |_input: WorkerInput| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            }),
        )
        .with_gate(fast_gate()),
    ));

    let report = launcher(Arc::new(MemoryCoordinationStore::new()))
        .run_session(SessionId::from("S4"), pipelines)
        .await
        .unwrap();

    assert_eq!(
        report.decision_outcome(OutputKind::TradingDecision),
        Some(TerminalState::Failed)
    );
    assert_eq!(report.decision_outcome(OutputKind::ResearchReport), Some(TerminalState::Completed));
    assert_eq!(adjudications.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_session_discards_results() {
    let store = Arc::new(MemoryCoordinationStore::new());
    let session = SessionId::from("S5");

    let slow: Vec<Arc<dyn Pipeline>> = OutputKind::leaf_kinds()
        .into_iter()
        .map(|kind| {
            let worker = FnWorker::shared(kind.as_str(), |_input: WorkerInput| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({"late": true}))
            });
            Arc::new(LeafPipeline::new(kind, worker)) as Arc<dyn Pipeline>
        })
        .chain(session_pipelines(None, DegradedPolicy::Abort).into_iter().skip(4))
        .collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let report = launcher(store.clone())
        .run_session_with_cancel(session.clone(), slow, cancel)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Cancelled);
    for (kind, state) in report.terminal_states() {
        assert_eq!(state, TerminalState::Cancelled, "{} should be cancelled", kind);
    }

    for record in store.query_all(&session).await.unwrap() {
        assert_ne!(
            record.status,
            RecordStatus::Complete,
            "{} persisted after cancel",
            record.output_kind
        );
    }
    let row = store.get_session(&session).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn test_session_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteCoordinationStore::open(StoreConfig::with_path(dir.path().join("coord.db"))).unwrap(),
    );
    let session = SessionId::from("S6");

    let report = launcher(store.clone())
        .run_session(session.clone(), session_pipelines(None, DegradedPolicy::Abort))
        .await
        .unwrap();
    assert!(report.is_successful(), "{}", report.to_json().unwrap());

    let records = store.query_all(&session).await.unwrap();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.status == RecordStatus::Complete));

    let sequence: Vec<_> = records.iter().map(|r| r.sequence_no).collect();
    let mut sorted = sequence.clone();
    sorted.sort();
    assert_eq!(sequence, sorted, "query_all is in commit order");
    assert_eq!(records.last().unwrap().output_kind, OutputKind::TradingDecision);

    let row = store.get_session(&session).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Completed);

    tokio_test::assert_ok!(store.shutdown().await);
}
