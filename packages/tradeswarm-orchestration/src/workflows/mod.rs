//! Multi-call pipelines built on the dispatcher

pub mod convergence;
pub mod review;

pub use convergence::{
    comparator_from_config, standard_report, ConfidenceGapComparator, ConvergenceComparator,
    ConvergenceSignal, ConvergenceState, ConvergenceWorkflow, StablePositionComparator,
};
pub use review::{ReviewStage, SequentialReviewWorkflow};
