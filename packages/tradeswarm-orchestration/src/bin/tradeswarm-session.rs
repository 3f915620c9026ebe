//! Tradeswarm session runner
//!
//! Runs one session with synthetic workers: four leaf analyses, the research
//! convergence and the decision review. Prints the session report as JSON.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store, default configuration
//! cargo run --bin tradeswarm-session
//!
//! # SQLite store, custom configuration, news analysis failing
//! cargo run --bin tradeswarm-session -- \
//!     --db /tmp/coord.db --config session.yaml --fail news_analysis -v
//! ```

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tradeswarm_orchestration::storage::{
    CoordinationStore, MemoryCoordinationStore, OutputKind, SessionId, SqliteCoordinationStore,
    StoreConfig,
};
use tradeswarm_orchestration::telemetry;
use tradeswarm_orchestration::{
    ConvergenceWorkflow, FnWorker, GateOptions, LeafPipeline, OrchestrationConfig, Pipeline,
    SequentialReviewWorkflow, SessionLauncher, SharedWorker, TaskDispatcher, WorkerError,
    WorkerInput,
};

#[derive(Parser)]
#[command(name = "tradeswarm-session")]
#[command(about = "Run one tradeswarm session with synthetic workers", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session identifier (random when omitted)
    #[arg(short, long)]
    session_id: Option<String>,

    /// SQLite database path (in-memory store when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Leaf output kind whose worker fails fatally
    #[arg(long, value_parser = parse_kind)]
    fail: Option<OutputKind>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_kind(s: &str) -> Result<OutputKind, String> {
    OutputKind::from_str(s).map_err(|e| e.to_string())
}

fn analyst(kind: OutputKind, fail: bool) -> SharedWorker {
    FnWorker::shared(format!("{}_analyst", kind.as_str()), move |input: WorkerInput| async move {
        if fail {
            return Err(WorkerError::fatal(format!("{} source unavailable", kind)));
        }
        Ok(json!({
            "session_id": input.session_id,
            "kind": kind,
            "signal": "neutral",
            "confidence": 0.5,
        }))
    })
}

/// Researcher holding `base` confidence, pulled halfway toward its peer
fn researcher(name: &'static str, base: f64) -> SharedWorker {
    FnWorker::shared(name, move |input: WorkerInput| async move {
        let peer = input
            .context_value("peer_position")
            .and_then(|p| p.get("confidence"))
            .and_then(Value::as_f64);
        let confidence = peer.map_or(base, |peer| (base + peer) / 2.0);
        Ok(json!({
            "researcher": name,
            "confidence": confidence,
            "inputs": input.upstream.len(),
        }))
    })
}

fn stage(name: &'static str) -> SharedWorker {
    FnWorker::shared(name, move |input: WorkerInput| async move {
        Ok(json!({
            "stage": name,
            "saw_proposal": input.context_value("proposal").is_some(),
            "saw_review": input.context_value("review").is_some(),
            "action": "hold",
        }))
    })
}

fn pipelines(config: &OrchestrationConfig, fail: Option<OutputKind>) -> Vec<Arc<dyn Pipeline>> {
    let gate = GateOptions::from(&config.gate);

    let mut pipelines: Vec<Arc<dyn Pipeline>> = OutputKind::leaf_kinds()
        .into_iter()
        .map(|kind| {
            let worker = analyst(kind, fail == Some(kind));
            Arc::new(LeafPipeline::new(kind, worker)) as Arc<dyn Pipeline>
        })
        .collect();

    pipelines.push(Arc::new(
        ConvergenceWorkflow::from_config(
            researcher("bull_researcher", 0.8),
            researcher("bear_researcher", 0.3),
            &config.convergence,
        )
        .with_gate(gate),
    ));
    pipelines.push(Arc::new(
        SequentialReviewWorkflow::new(
            stage("trader"),
            stage("risk_manager"),
            stage("portfolio_manager"),
        )
        .with_gate(gate),
    ));
    pipelines
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(telemetry::default_filter(cli.verbose));

    let config = match &cli.config {
        Some(path) => OrchestrationConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestrationConfig::default(),
    };

    let store: Arc<dyn CoordinationStore> = match &cli.db {
        Some(path) => {
            let store_config = StoreConfig {
                path: path.clone(),
                ..config.store.clone()
            };
            let store = SqliteCoordinationStore::open(store_config)
                .context("opening coordination store")?;
            Arc::new(store)
        }
        None => Arc::new(MemoryCoordinationStore::new()),
    };

    let dispatcher = Arc::new(TaskDispatcher::new(config.dispatcher.clone()));
    let launcher = SessionLauncher::new(Arc::clone(&store), Arc::clone(&dispatcher));

    let session_id = cli
        .session_id
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);

    let report = launcher
        .run_session(session_id, pipelines(&config, cli.fail))
        .await?;

    store.shutdown().await?;

    println!("{}", report.to_json()?);
    println!("{}", serde_json::to_string_pretty(&dispatcher.stats())?);
    Ok(())
}
