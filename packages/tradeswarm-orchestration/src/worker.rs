//! Worker boundary
//!
//! A worker is the opaque unit of domain work a pipeline delegates to: given a
//! structured input it produces one JSON payload or fails. The orchestration
//! core never looks inside the payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tradeswarm_storage::{OutputKind, SessionId};

use crate::error::ErrorCategory;

/// Worker failure
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cause", rename_all = "snake_case")]
pub enum WorkerError {
    /// The call may succeed if retried later
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Transient(cause.into())
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self::Fatal(cause.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn cause(&self) -> &str {
        match self {
            Self::Transient(cause) | Self::Fatal(cause) => cause,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient(_) => ErrorCategory::Transient,
            Self::Fatal(_) => ErrorCategory::Permanent,
        }
    }
}

/// Structured worker input
///
/// `upstream` holds the complete payloads of the pipeline's required inputs;
/// `context` carries values supplied by a workflow (`peer_position`,
/// `proposal`, `review`, `iteration`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub session_id: SessionId,
    #[serde(default)]
    pub upstream: BTreeMap<OutputKind, Value>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub params: Value,
}

impl WorkerInput {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            upstream: BTreeMap::new(),
            context: BTreeMap::new(),
            params: Value::Null,
        }
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<OutputKind, Value>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn upstream_payload(&self, kind: OutputKind) -> Option<&Value> {
        self.upstream.get(&kind)
    }

    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// Pluggable `execute(input) -> output` capability
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identifier written as `producer_id` on persisted records
    fn producer_id(&self) -> &str;

    async fn execute(&self, input: WorkerInput) -> Result<Value, WorkerError>;
}

pub type SharedWorker = Arc<dyn Worker>;

/// Adapter turning an async closure into a [`Worker`]
///
/// ```rust,ignore
/// let worker = FnWorker::new("news_analyst", |input: WorkerInput| async move {
///     Ok(serde_json::json!({"session": input.session_id.as_str()}))
/// });
/// ```
pub struct FnWorker<F> {
    producer_id: String,
    f: F,
}

impl<F> FnWorker<F> {
    pub fn new(producer_id: impl Into<String>, f: F) -> Self {
        Self {
            producer_id: producer_id.into(),
            f,
        }
    }
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(WorkerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
{
    pub fn shared(producer_id: impl Into<String>, f: F) -> SharedWorker {
        Arc::new(Self::new(producer_id, f))
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(WorkerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
{
    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    async fn execute(&self, input: WorkerInput) -> Result<Value, WorkerError> {
        (self.f)(input).await
    }
}
