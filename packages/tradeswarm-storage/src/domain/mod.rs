//! Domain layer for the coordination store
//!
//! # Core Principles
//!
//! 1. **Session Identity**: every record is keyed by `(session_id, output_kind)`
//! 2. **Single Writer**: all mutations are serialized through one writer queue
//! 3. **At Most One Complete**: once a key holds a `Complete` record, further writes are rejected
//!
//! # Domain Models
//!
//! - `SessionId`: immutable identifier of one decision cycle
//! - `OutputKind`: fixed set of pipeline outputs
//! - `OutputRecord`: one persisted pipeline output (append-only)
//! - `Session`: session bookkeeping row
//! - `Ack`: commit acknowledgement returned by the writer
//!
//! # Port Trait
//!
//! - `CoordinationStore`: primary storage abstraction shared by every pipeline
//!
//! # Examples
//!
//! ```rust,ignore
//! use tradeswarm_storage::domain::{CoordinationStore, OutputKind, OutputRecord, SessionId};
//!
//! async fn example(store: impl CoordinationStore) -> Result<()> {
//!     let session = SessionId::from("S1");
//!     let record = OutputRecord::complete(
//!         session.clone(),
//!         OutputKind::MarketAnalysis,
//!         "market_pipeline",
//!         serde_json::json!({"signal": "buy"}),
//!     );
//!     let ack = store.submit(record).await?;
//!
//!     // A read started after the ack observes the write
//!     let latest = store.query(&session, OutputKind::MarketAnalysis).await?;
//!     assert_eq!(latest.unwrap().sequence_no, ack.sequence_no);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Session identifier
///
/// Correlates every record produced for one decision cycle. Never mutated.
///
/// ```rust
/// use tradeswarm_storage::domain::SessionId;
///
/// let id = SessionId::from("S1");
/// assert_eq!(id.as_str(), "S1");
/// assert_ne!(SessionId::generate(), SessionId::generate());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output kind (one per pipeline)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    MarketAnalysis,
    SocialAnalysis,
    NewsAnalysis,
    FundamentalsAnalysis,
    ResearchReport,
    TradingDecision,
}

impl OutputKind {
    pub const ALL: [OutputKind; 6] = [
        OutputKind::MarketAnalysis,
        OutputKind::SocialAnalysis,
        OutputKind::NewsAnalysis,
        OutputKind::FundamentalsAnalysis,
        OutputKind::ResearchReport,
        OutputKind::TradingDecision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::MarketAnalysis => "market_analysis",
            OutputKind::SocialAnalysis => "social_analysis",
            OutputKind::NewsAnalysis => "news_analysis",
            OutputKind::FundamentalsAnalysis => "fundamentals_analysis",
            OutputKind::ResearchReport => "research_report",
            OutputKind::TradingDecision => "trading_decision",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "market_analysis" => Ok(OutputKind::MarketAnalysis),
            "social_analysis" => Ok(OutputKind::SocialAnalysis),
            "news_analysis" => Ok(OutputKind::NewsAnalysis),
            "fundamentals_analysis" => Ok(OutputKind::FundamentalsAnalysis),
            "research_report" => Ok(OutputKind::ResearchReport),
            "trading_decision" => Ok(OutputKind::TradingDecision),
            _ => Err(StorageError::serialization(format!(
                "Invalid output kind: {}",
                s
            ))),
        }
    }

    /// The four independent analyses that have no upstream dependency
    pub fn leaf_kinds() -> [OutputKind; 4] {
        [
            OutputKind::MarketAnalysis,
            OutputKind::SocialAnalysis,
            OutputKind::NewsAnalysis,
            OutputKind::FundamentalsAnalysis,
        ]
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Complete,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Complete => "complete",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "complete" => Ok(RecordStatus::Complete),
            "failed" => Ok(RecordStatus::Failed),
            _ => Err(StorageError::serialization(format!(
                "Invalid record status: {}",
                s
            ))),
        }
    }

    /// Complete or failed; a pending record is still in flight
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Complete | RecordStatus::Failed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted pipeline output
///
/// Records are append-only. The payload schema belongs to the producing
/// pipeline; the store treats it as an opaque JSON document.
///
/// `sequence_no` is `None` until the writer commits the record.
///
/// ```rust
/// use tradeswarm_storage::domain::{OutputKind, OutputRecord, RecordStatus, SessionId};
///
/// let record = OutputRecord::complete(
///     SessionId::from("S1"),
///     OutputKind::NewsAnalysis,
///     "news_pipeline",
///     serde_json::json!({"headline_count": 12}),
/// );
/// assert_eq!(record.status, RecordStatus::Complete);
/// assert!(record.sequence_no.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub session_id: SessionId,
    pub output_kind: OutputKind,
    pub payload: serde_json::Value,
    pub producer_id: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sequence_no: Option<i64>,
}

impl OutputRecord {
    pub fn new(
        session_id: SessionId,
        output_kind: OutputKind,
        producer_id: impl Into<String>,
        status: RecordStatus,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            output_kind,
            payload,
            producer_id: producer_id.into(),
            status,
            created_at: Utc::now(),
            sequence_no: None,
        }
    }

    pub fn pending(
        session_id: SessionId,
        output_kind: OutputKind,
        producer_id: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            output_kind,
            producer_id,
            RecordStatus::Pending,
            serde_json::Value::Null,
        )
    }

    pub fn complete(
        session_id: SessionId,
        output_kind: OutputKind,
        producer_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            session_id,
            output_kind,
            producer_id,
            RecordStatus::Complete,
            payload,
        )
    }

    /// Failure record; payload carries `{"error": ...}`
    pub fn failed(
        session_id: SessionId,
        output_kind: OutputKind,
        producer_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            output_kind,
            producer_id,
            RecordStatus::Failed,
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn is_complete(&self) -> bool {
        self.status == RecordStatus::Complete
    }
}

/// Commit acknowledgement from the writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Sequence number of the committed record (record writes only)
    pub sequence_no: Option<i64>,
    /// Rows touched by the operation
    pub rows_affected: usize,
    pub committed_at: DateTime<Utc>,
}

impl Ack {
    pub fn record(sequence_no: i64) -> Self {
        Self {
            sequence_no: Some(sequence_no),
            rows_affected: 1,
            committed_at: Utc::now(),
        }
    }

    pub fn rows(rows_affected: usize) -> Self {
        Self {
            sequence_no: None,
            rows_affected,
            committed_at: Utc::now(),
        }
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            _ => Err(StorageError::serialization(format!(
                "Invalid session status: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session bookkeeping row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// New running session
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Write admission rule shared by every adapter.
///
/// `latest` is the status of the newest record stored for the key, if any.
pub fn admit(latest: Option<RecordStatus>, incoming: &OutputRecord) -> Result<()> {
    match latest {
        Some(RecordStatus::Complete) => Err(StorageError::duplicate_record(
            &incoming.session_id,
            incoming.output_kind,
        )),
        _ => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Coordination store port
///
/// Every write goes through a single serialized writer; reads never wait for
/// the writer or for each other, and observe every write acknowledged before
/// the read began.
///
/// Implementations are shared as `Arc<dyn CoordinationStore>` between all
/// pipelines of a process.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Enqueue a record for the writer and wait for the commit result
    ///
    /// # Errors
    ///
    /// - `DuplicateRecord` if a complete record already exists for the key
    /// - `Database` / `IO` / `WriterClosed` for storage faults
    async fn submit(&self, record: OutputRecord) -> Result<Ack>;

    /// Latest record for `(session_id, output_kind)`
    async fn query(
        &self,
        session_id: &SessionId,
        output_kind: OutputKind,
    ) -> Result<Option<OutputRecord>>;

    /// Latest record per output kind for a session, in commit order
    async fn query_all(&self, session_id: &SessionId) -> Result<Vec<OutputRecord>>;

    /// Register a running session
    async fn create_session(&self, session: Session) -> Result<Ack>;

    /// Mark a session finished
    async fn finish_session(&self, session_id: &SessionId, status: SessionStatus) -> Result<Ack>;

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// Remove finished sessions created before `cutoff`, with their records
    ///
    /// Running sessions are never touched.
    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<Ack>;

    /// Close the writer queue and wait for queued writes to drain
    async fn shutdown(&self) -> Result<()>;
}
