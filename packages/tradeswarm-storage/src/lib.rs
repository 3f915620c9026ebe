//! Coordination store for tradeswarm sessions
//!
//! > Every pipeline writes through one queue; everyone reads without waiting.
//!
//! ## Core Principles
//!
//! 1. **Single Writer**: mutations are applied one at a time, in enqueue order
//! 2. **Read-after-ack**: a read started after an ack observes that write
//! 3. **At Most One Complete**: a `(session_id, output_kind)` key is sealed by its first
//!    complete record
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tradeswarm_storage::{CoordinationStore, OutputKind, OutputRecord, SessionId};
//! use tradeswarm_storage::{SqliteCoordinationStore, StoreConfig};
//!
//! let store = SqliteCoordinationStore::open(StoreConfig::with_path("coord.db"))?;
//!
//! // 1. Pipelines submit their output
//! let session = SessionId::generate();
//! store.submit(OutputRecord::complete(
//!     session.clone(),
//!     OutputKind::MarketAnalysis,
//!     "market_pipeline",
//!     serde_json::json!({"signal": "buy"}),
//! )).await?;
//!
//! // 2. Anyone reads the latest record per kind
//! let records = store.query_all(&session).await?;
//!
//! // 3. Drain and stop the writer
//! store.shutdown().await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod writer;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    Ack, CoordinationStore, OutputKind, OutputRecord, RecordStatus, Session, SessionId,
    SessionStatus,
};

pub use infrastructure::MemoryCoordinationStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteCoordinationStore, StoreConfig};
