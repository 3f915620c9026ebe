use thiserror::Error;
use tradeswarm_storage::StorageError;

use crate::config::ConfigError;
use crate::worker::WorkerError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session cancelled: {0}")]
    SessionCancelled(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("DAG cycle detected among: {0}")]
    DagCycleDetected(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Duplicate pipeline for output kind: {0}")]
    DuplicatePipeline(String),

    #[error("Stage execution failed: {0}")]
    StageExecutionFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::SessionCancelled(reason.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::SessionCancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Retry classification of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Storage(e) if e.is_fault() => ErrorCategory::Infrastructure,
            Self::Storage(_) => ErrorCategory::Permanent,
            Self::Worker(e) => e.category(),
            Self::Timeout(_) => ErrorCategory::Transient,
            Self::Other(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, rate limited upstream)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, fatal worker failure)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full, dead writer)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_storage_error_classification() {
        let fault: OrchestratorError = StorageError::writer_closed().into();
        assert_eq!(fault.category(), ErrorCategory::Infrastructure);

        let rejected: OrchestratorError =
            StorageError::duplicate_record("S1", "trading_decision").into();
        assert_eq!(rejected.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_worker_error_classification() {
        let transient: OrchestratorError = WorkerError::transient("429 from upstream").into();
        assert_eq!(transient.category(), ErrorCategory::Transient);

        let fatal: OrchestratorError = WorkerError::fatal("bad input").into();
        assert_eq!(fatal.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_cancel_and_timeout_predicates() {
        assert!(OrchestratorError::cancelled("shutdown").is_cancelled());
        assert!(OrchestratorError::Timeout("10s".into()).is_timeout());
        assert!(!OrchestratorError::Timeout("10s".into()).is_cancelled());
    }
}
