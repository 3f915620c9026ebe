//! SQLite coordination store
//!
//! - Single writer thread owning the only read-write connection
//! - WAL journal so readers never wait for the writer
//! - Append-only `output_records` keyed by `(session_id, output_kind)`

mod reader;
mod schema;
mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

use crate::domain::{
    Ack, CoordinationStore, OutputKind, OutputRecord, Session, SessionId, SessionStatus,
};
use crate::writer::{WriteOp, WriteQueue};
use crate::{Result, StorageError};

use reader::ReaderPool;

const SYNCHRONOUS_MODES: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

/// SQLite store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; created if missing
    pub path: PathBuf,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
    /// `PRAGMA synchronous` for the writer
    pub synchronous: String,
    /// Read-only connections kept open between reads
    pub max_idle_readers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tradeswarm.db"),
            busy_timeout_ms: 5_000,
            synchronous: "NORMAL".to_string(),
            max_idle_readers: 8,
        }
    }
}

impl StoreConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() || self.path.as_os_str() == ":memory:" {
            return Err(StorageError::config(
                "store path must be a file; readers need their own connections",
            ));
        }
        if !SYNCHRONOUS_MODES.contains(&self.synchronous.to_uppercase().as_str()) {
            return Err(StorageError::config(format!(
                "synchronous must be one of {:?}, got '{}'",
                SYNCHRONOUS_MODES, self.synchronous
            )));
        }
        Ok(())
    }

    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// SQLite-backed [`CoordinationStore`]
///
/// ```rust,ignore
/// let store = SqliteCoordinationStore::open(StoreConfig::with_path("coord.db"))?;
/// let ack = store.submit(record).await?;
/// store.shutdown().await?;
/// ```
pub struct SqliteCoordinationStore {
    config: StoreConfig,
    queue: WriteQueue,
    readers: Arc<ReaderPool>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteCoordinationStore {
    /// Open (or create) the database and start the writer thread
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let conn = schema::open_writer(
            &config.path,
            config.busy_timeout(),
            &config.synchronous.to_uppercase(),
        )?;
        let (queue, rx) = WriteQueue::new();

        let writer = std::thread::Builder::new()
            .name("tradeswarm-writer".to_string())
            .spawn(move || writer::run(conn, rx))?;

        let readers = Arc::new(ReaderPool::new(
            config.path.clone(),
            config.busy_timeout(),
            config.max_idle_readers,
        ));

        info!(path = %config.path.display(), "opened coordination store");

        Ok(Self {
            config,
            queue,
            readers,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let readers = Arc::clone(&self.readers);
        tokio::task::spawn_blocking(move || {
            let conn = readers.checkout()?;
            let result = f(&conn);
            readers.checkin(conn);
            result
        })
        .await
        .map_err(|e| StorageError::database(format!("read task failed: {}", e)))?
    }
}

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn submit(&self, record: OutputRecord) -> Result<Ack> {
        self.queue.submit(WriteOp::Record(record)).await
    }

    async fn query(
        &self,
        session_id: &SessionId,
        output_kind: OutputKind,
    ) -> Result<Option<OutputRecord>> {
        let session_id = session_id.clone();
        self.read(move |conn| reader::latest_record(conn, &session_id, output_kind))
            .await
    }

    async fn query_all(&self, session_id: &SessionId) -> Result<Vec<OutputRecord>> {
        let session_id = session_id.clone();
        self.read(move |conn| reader::latest_per_kind(conn, &session_id))
            .await
    }

    async fn create_session(&self, session: Session) -> Result<Ack> {
        self.queue.submit(WriteOp::CreateSession(session)).await
    }

    async fn finish_session(&self, session_id: &SessionId, status: SessionStatus) -> Result<Ack> {
        self.queue
            .submit(WriteOp::FinishSession {
                session_id: session_id.clone(),
                status,
                finished_at: Utc::now(),
            })
            .await
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let session_id = session_id.clone();
        self.read(move |conn| reader::session(conn, &session_id))
            .await
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<Ack> {
        self.queue.submit(WriteOp::Purge { cutoff }).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.queue.close();

        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| StorageError::database(format!("writer join failed: {}", e)))?
                .map_err(|_| StorageError::database("coordination writer panicked"))?;
            info!(path = %self.config.path.display(), "coordination store shut down");
        }
        Ok(())
    }
}

impl Drop for SqliteCoordinationStore {
    fn drop(&mut self) {
        // The writer thread exits once the queue drains
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecordStatus;
    use crate::ErrorKind;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, SqliteCoordinationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteCoordinationStore::open(StoreConfig::with_path(dir.path().join("coord.db")))
                .unwrap();
        (dir, store)
    }

    #[test]
    fn test_config_validation() {
        assert!(StoreConfig::default().validate().is_ok());

        let err = StoreConfig::with_path(":memory:").validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);

        let config = StoreConfig {
            synchronous: "sometimes".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StoreConfig {
            synchronous: "full".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_submit_then_query() {
        let (_dir, store) = open_temp();
        let session = SessionId::from("S1");

        let ack = store
            .submit(OutputRecord::complete(
                session.clone(),
                OutputKind::MarketAnalysis,
                "market_pipeline",
                json!({"signal": "buy", "confidence": 0.7}),
            ))
            .await
            .unwrap();
        assert!(ack.sequence_no.is_some());

        let record = store
            .query(&session, OutputKind::MarketAnalysis)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sequence_no, ack.sequence_no);
        assert_eq!(record.status, RecordStatus::Complete);
        assert_eq!(record.payload["signal"], "buy");

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_missing_is_none() {
        let (_dir, store) = open_temp();
        let record = store
            .query(&SessionId::from("nobody"), OutputKind::NewsAnalysis)
            .await
            .unwrap();
        assert!(record.is_none());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_connections_are_reused() {
        let (_dir, store) = open_temp();
        let session = SessionId::from("S1");

        for _ in 0..3 {
            store.query_all(&session).await.unwrap();
        }
        assert_eq!(store.readers.idle_count(), 1);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (_dir, store) = open_temp();
        store.shutdown().await.unwrap();
        store.shutdown().await.unwrap();
    }
}
