//! In-memory coordination store
//!
//! Same contract as the SQLite adapter, minus durability. The writer is a
//! Tokio task, so this adapter works under paused test time.
//!
//! Readers never wait on the write queue. A write holds the shard lock of its
//! session only while admitting and appending one record, with no `.await`
//! inside, so a reader on the same shard waits at most one append.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{
    admit, Ack, CoordinationStore, OutputKind, OutputRecord, Session, SessionId, SessionStatus,
};
use crate::writer::{WriteOp, WriteQueue, WriteRequest};
use crate::{ErrorKind, Result, StorageError};

#[derive(Default)]
struct Tables {
    /// Per-session records in commit order
    records: DashMap<SessionId, Vec<OutputRecord>>,
    sessions: DashMap<SessionId, Session>,
}

/// In-memory [`CoordinationStore`]
pub struct MemoryCoordinationStore {
    tables: Arc<Tables>,
    queue: WriteQueue,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCoordinationStore {
    /// Create the store and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let tables = Arc::new(Tables::default());
        let (queue, rx) = WriteQueue::new();
        let writer = tokio::spawn(run_writer(Arc::clone(&tables), rx));

        Self {
            tables,
            queue,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Number of records stored for a session, including superseded ones
    pub fn record_count(&self, session_id: &SessionId) -> usize {
        self.tables
            .records
            .get(session_id)
            .map(|records| records.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_writer(tables: Arc<Tables>, mut rx: UnboundedReceiver<WriteRequest>) {
    let mut next_seq: i64 = 0;

    while let Some(WriteRequest { op, reply, .. }) = rx.recv().await {
        let op_name = op.name();
        let result = apply(&tables, &mut next_seq, op);
        if let Err(e) = &result {
            warn!(op = op_name, error = %e, "write rejected");
        }
        WriteRequest::respond(reply, result);
    }

    debug!(records = next_seq, "in-memory writer stopped");
}

fn apply(tables: &Tables, next_seq: &mut i64, op: WriteOp) -> Result<Ack> {
    match op {
        WriteOp::Record(mut record) => {
            let mut records = tables.records.entry(record.session_id.clone()).or_default();
            let latest = records
                .iter()
                .rev()
                .find(|r| r.output_kind == record.output_kind)
                .map(|r| r.status);
            admit(latest, &record)?;

            *next_seq += 1;
            record.sequence_no = Some(*next_seq);
            records.push(record);
            Ok(Ack::record(*next_seq))
        }
        WriteOp::CreateSession(session) => {
            if tables.sessions.contains_key(&session.id) {
                return Err(StorageError::new(
                    ErrorKind::DuplicateRecord,
                    format!("Session already exists: {}", session.id),
                ));
            }
            tables.sessions.insert(session.id.clone(), session);
            Ok(Ack::rows(1))
        }
        WriteOp::FinishSession {
            session_id,
            status,
            finished_at,
        } => {
            let mut session = tables
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| StorageError::session_not_found(session_id.as_str()))?;
            session.status = status;
            session.completed_at = Some(finished_at);
            Ok(Ack::rows(1))
        }
        WriteOp::Purge { cutoff } => {
            let expired: Vec<SessionId> = tables
                .sessions
                .iter()
                .filter(|s| s.created_at < cutoff && s.status != SessionStatus::Running)
                .map(|s| s.id.clone())
                .collect();

            let mut rows = 0;
            for id in expired {
                if tables.sessions.remove(&id).is_some() {
                    rows += 1;
                }
                if let Some((_, records)) = tables.records.remove(&id) {
                    rows += records.len();
                }
            }
            Ok(Ack::rows(rows))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn submit(&self, record: OutputRecord) -> Result<Ack> {
        self.queue.submit(WriteOp::Record(record)).await
    }

    async fn query(
        &self,
        session_id: &SessionId,
        output_kind: OutputKind,
    ) -> Result<Option<OutputRecord>> {
        Ok(self.tables.records.get(session_id).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.output_kind == output_kind)
                .cloned()
        }))
    }

    async fn query_all(&self, session_id: &SessionId) -> Result<Vec<OutputRecord>> {
        let Some(records) = self.tables.records.get(session_id) else {
            return Ok(Vec::new());
        };

        let mut latest: BTreeMap<OutputKind, &OutputRecord> = BTreeMap::new();
        for record in records.iter() {
            latest.insert(record.output_kind, record);
        }
        let mut out: Vec<OutputRecord> = latest.into_values().cloned().collect();
        out.sort_by_key(|r| r.sequence_no);
        Ok(out)
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
        Ok(self.tables.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<Ack> {
        self.queue.submit(WriteOp::Purge { cutoff }).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.queue.close();
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| StorageError::database(format!("writer task failed: {}", e)))?;
        }
        Ok(())
    }
}
