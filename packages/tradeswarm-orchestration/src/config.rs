//! Orchestration configuration
//!
//! Everything the core consumes at session-launch time: store location,
//! dispatcher limits, readiness-gate timing and convergence policy. Loaded
//! from YAML; every section and field is optional and falls back to the
//! defaults below.
//!
//! ```yaml
//! dispatcher:
//!   max_concurrent: 8
//!   rate_per_sec: 2.5
//! gate:
//!   poll_interval_ms: 250
//!   deadline_ms: 30000
//!   backoff:
//!     kind: exponential
//!     factor: 2.0
//!     max_interval_ms: 4000
//! convergence:
//!   max_iterations: 5
//!   comparator: stable_position
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tradeswarm_storage::StoreConfig;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Two fields that are valid alone but not together
    #[error("Conflicting configuration: {issue}. Fix: {fix}")]
    Conflict { issue: String, fix: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Custom(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }

    pub fn conflict(issue: impl Into<String>, fix: impl Into<String>) -> Self {
        Self::Conflict {
            issue: issue.into(),
            fix: fix.into(),
        }
    }
}

fn check_range<T>(field: &str, value: T, min: T, max: T, hint: &str) -> ConfigResult<()>
where
    T: PartialOrd + ToString + Copy,
{
    if value < min || value > max {
        return Err(ConfigError::range_with_hint(field, value, min, max, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

/// Retry policy applied uniformly by the dispatcher to transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt`
    ///
    /// 1-based: the wait after the first failure is `backoff_for(1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "dispatcher.retry.max_attempts",
            self.max_attempts,
            1,
            20,
            "Use 1 to disable retries",
        )?;
        check_range(
            "dispatcher.retry.multiplier",
            self.multiplier,
            1.0,
            10.0,
            "Use 1.0 for a constant backoff",
        )?;
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::conflict(
                format!(
                    "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
                "raise dispatcher.retry.max_backoff_ms or lower initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Task dispatcher limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker calls allowed to run at the same time
    pub max_concurrent: usize,
    /// Token refill rate (call starts per second)
    pub rate_per_sec: f64,
    /// Token bucket capacity (burst size)
    pub bucket_capacity: u32,
    /// Budget for a single worker call; exceeding it counts as a transient failure
    pub call_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            rate_per_sec: 10.0,
            bucket_capacity: 60,
            call_timeout_ms: 300_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "dispatcher.max_concurrent",
            self.max_concurrent,
            1,
            1024,
            "Bounded by how many calls the upstream tolerates at once",
        )?;
        check_range(
            "dispatcher.rate_per_sec",
            self.rate_per_sec,
            0.001,
            10_000.0,
            "Fractional rates are allowed, e.g. 0.5 for one call every two seconds",
        )?;
        check_range(
            "dispatcher.bucket_capacity",
            self.bucket_capacity,
            1,
            100_000,
            "Capacity is the largest burst of call starts",
        )?;
        check_range(
            "dispatcher.call_timeout_ms",
            self.call_timeout_ms,
            1,
            3_600_000,
            "At most one hour per call",
        )?;
        self.retry.validate()
    }
}

/// Poll interval growth between readiness checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollBackoff {
    Fixed,
    Exponential { factor: f64, max_interval_ms: u64 },
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::Fixed
    }
}

impl PollBackoff {
    /// Interval to use after a poll that waited `current`
    pub fn next_interval(&self, current: Duration) -> Duration {
        match *self {
            PollBackoff::Fixed => current,
            PollBackoff::Exponential {
                factor,
                max_interval_ms,
            } => {
                let max = Duration::from_millis(max_interval_ms);
                let next = current.as_secs_f64() * factor;
                if next >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(next.max(0.0))
                }
            }
        }
    }
}

/// Readiness gate timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub poll_interval_ms: u64,
    pub deadline_ms: u64,
    pub backoff: PollBackoff,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            deadline_ms: 60_000,
            backoff: PollBackoff::Fixed,
        }
    }
}

impl GateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "gate.poll_interval_ms",
            self.poll_interval_ms,
            1,
            60_000,
            "Polls are cheap reads; 100-1000ms is typical",
        )?;
        check_range(
            "gate.deadline_ms",
            self.deadline_ms,
            self.poll_interval_ms,
            86_400_000,
            "The deadline must allow at least one poll interval",
        )?;
        if let PollBackoff::Exponential {
            factor,
            max_interval_ms,
        } = self.backoff
        {
            check_range(
                "gate.backoff.factor",
                factor,
                1.0,
                10.0,
                "Use kind: fixed for a constant interval",
            )?;
            if max_interval_ms < self.poll_interval_ms {
                return Err(ConfigError::conflict(
                    format!(
                        "gate.backoff.max_interval_ms ({}) is below poll_interval_ms ({})",
                        max_interval_ms, self.poll_interval_ms
                    ),
                    "set max_interval_ms to at least the initial poll interval",
                ));
            }
        }
        Ok(())
    }
}

/// Built-in convergence comparators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparatorKind {
    /// Parties' confidence values within `confidence_threshold` of each other
    ConfidenceGap,
    /// Neither party changed position since the previous round
    StablePosition,
}

/// Convergence workflow policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Hard cap on rounds; always enforced
    pub max_iterations: u32,
    pub comparator: ComparatorKind,
    /// Payload field compared by the confidence-gap comparator
    pub confidence_field: String,
    pub confidence_threshold: f64,
    /// Payload field compared by the stable-position comparator; whole payload when absent
    pub position_field: Option<String>,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            comparator: ComparatorKind::ConfidenceGap,
            confidence_field: "confidence".to_string(),
            confidence_threshold: 0.1,
            position_field: None,
        }
    }
}

impl ConvergenceConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "convergence.max_iterations",
            self.max_iterations,
            1,
            100,
            "Every round costs two worker calls",
        )?;
        check_range(
            "convergence.confidence_threshold",
            self.confidence_threshold,
            0.0,
            1.0,
            "Threshold is an absolute difference between confidences",
        )?;
        if self.confidence_field.trim().is_empty() {
            return Err(ConfigError::Custom(
                "convergence.confidence_field must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Root
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub gate: GateConfig,
    pub convergence: ConvergenceConfig,
}

impl OrchestrationConfig {
    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.store
            .validate()
            .map_err(|e| ConfigError::Custom(format!("store: {}", e)))?;
        self.dispatcher.validate()?;
        self.gate.validate()?;
        self.convergence.validate()?;
        Ok(())
    }
}
