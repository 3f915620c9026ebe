/*
 * Tradeswarm Orchestration - session coordination core
 *
 * Runs the analysis pipelines of one trading session concurrently and lets
 * them coordinate only through the coordination store.
 *
 * Architecture:
 * - Coordination store (tradeswarm-storage, single writer)
 * - Readiness gate (polling with deadline)
 * - Task dispatcher (slot pool + token bucket + retry)
 * - Pipeline state machine and runner
 * - Workflows (convergence, sequential review)
 * - Session launcher (fault-isolated fan-out)
 */

// Public modules
pub mod config;
pub mod dag;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod launcher;
pub mod pipeline;
pub mod telemetry;
pub mod worker;
pub mod workflows;

// Re-exports
pub use config::{
    ComparatorKind, ConfigError, ConvergenceConfig, DispatcherConfig, GateConfig,
    OrchestrationConfig, PollBackoff, RetryPolicy,
};
pub use dag::PipelineSet;
pub use dispatcher::{DispatchSlot, DispatcherStats, TaskDispatcher, TokenBucket};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use gate::{GateOptions, ReadinessGate, SessionSnapshot};
pub use launcher::{SessionLauncher, SessionReport};
pub use pipeline::{
    DegradedPolicy, InputRequirement, LeafPipeline, Pipeline, PipelineContext, PipelineInputs,
    PipelineOutcome, PipelineRunner, PipelineState, PipelineStateMachine, TerminalState,
};
pub use worker::{FnWorker, SharedWorker, Worker, WorkerError, WorkerInput};
pub use workflows::{
    ConfidenceGapComparator, ConvergenceComparator, ConvergenceSignal, ConvergenceState,
    ConvergenceWorkflow, ReviewStage, SequentialReviewWorkflow, StablePositionComparator,
};

pub use tradeswarm_storage as storage;
