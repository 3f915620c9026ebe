//! Writer thread for the SQLite coordination store
//!
//! One OS thread owns the only read-write connection. It drains the
//! [`WriteQueue`](crate::writer::WriteQueue) in FIFO order and applies each
//! operation in its own transaction, so every ack corresponds to a commit.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::domain::{admit, Ack, OutputRecord, RecordStatus, Session, SessionId, SessionStatus};
use crate::writer::{WriteOp, WriteRequest};
use crate::{Result, StorageError};

pub(crate) fn run(mut conn: Connection, mut rx: UnboundedReceiver<WriteRequest>) {
    info!("coordination writer started");
    let mut applied: u64 = 0;

    while let Some(WriteRequest {
        op,
        enqueued_at,
        reply,
    }) = rx.blocking_recv()
    {
        let op_name = op.name();
        let result = apply(&mut conn, op);

        match &result {
            Ok(ack) => {
                applied += 1;
                debug!(
                    op = op_name,
                    sequence_no = ?ack.sequence_no,
                    rows = ack.rows_affected,
                    queued_ms = enqueued_at.elapsed().as_millis() as u64,
                    "write committed"
                );
            }
            Err(e) if e.is_fault() => error!(op = op_name, error = %e, "write failed"),
            Err(e) => warn!(op = op_name, error = %e, "write rejected"),
        }

        WriteRequest::respond(reply, result);
    }

    info!(applied, "coordination writer stopped");
}

fn apply(conn: &mut Connection, op: WriteOp) -> Result<Ack> {
    let tx = conn.transaction()?;
    let ack = match op {
        WriteOp::Record(record) => insert_record(&tx, &record)?,
        WriteOp::CreateSession(session) => insert_session(&tx, &session)?,
        WriteOp::FinishSession {
            session_id,
            status,
            finished_at,
        } => finish_session(&tx, &session_id, status, finished_at)?,
        WriteOp::Purge { cutoff } => purge(&tx, cutoff)?,
    };
    tx.commit()?;
    Ok(ack)
}

fn insert_record(tx: &Transaction<'_>, record: &OutputRecord) -> Result<Ack> {
    let latest: Option<String> = tx
        .query_row(
            "SELECT status FROM output_records
             WHERE session_id = ?1 AND output_kind = ?2
             ORDER BY sequence_no DESC LIMIT 1",
            params![record.session_id.as_str(), record.output_kind.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let latest = latest.as_deref().map(RecordStatus::from_str).transpose()?;
    admit(latest, record)?;

    let payload = serde_json::to_string(&record.payload)?;
    tx.execute(
        "INSERT INTO output_records
             (session_id, output_kind, producer_id, status, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.session_id.as_str(),
            record.output_kind.as_str(),
            record.producer_id,
            record.status.as_str(),
            payload,
            record.created_at.timestamp_millis(),
        ],
    )?;

    Ok(Ack::record(tx.last_insert_rowid()))
}

fn insert_session(tx: &Transaction<'_>, session: &Session) -> Result<Ack> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE session_id = ?1)",
        params![session.id.as_str()],
        |row| row.get(0),
    )?;
    if exists {
        return Err(StorageError::new(
            crate::ErrorKind::DuplicateRecord,
            format!("Session already exists: {}", session.id),
        ));
    }

    let rows = tx.execute(
        "INSERT INTO sessions (session_id, status, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            session.id.as_str(),
            session.status.as_str(),
            session.created_at.timestamp_millis(),
            session.completed_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(Ack::rows(rows))
}

fn finish_session(
    tx: &Transaction<'_>,
    session_id: &SessionId,
    status: SessionStatus,
    finished_at: DateTime<Utc>,
) -> Result<Ack> {
    let rows = tx.execute(
        "UPDATE sessions SET status = ?1, completed_at = ?2 WHERE session_id = ?3",
        params![
            status.as_str(),
            finished_at.timestamp_millis(),
            session_id.as_str()
        ],
    )?;
    if rows == 0 {
        return Err(StorageError::session_not_found(session_id.as_str()));
    }
    Ok(Ack::rows(rows))
}

fn purge(tx: &Transaction<'_>, cutoff: DateTime<Utc>) -> Result<Ack> {
    let cutoff = cutoff.timestamp_millis();
    let running = SessionStatus::Running.as_str();

    let records = tx.execute(
        "DELETE FROM output_records WHERE session_id IN (
             SELECT session_id FROM sessions WHERE created_at < ?1 AND status != ?2
         )",
        params![cutoff, running],
    )?;
    let sessions = tx.execute(
        "DELETE FROM sessions WHERE created_at < ?1 AND status != ?2",
        params![cutoff, running],
    )?;

    debug!(sessions, records, "purged finished sessions");
    Ok(Ack::rows(sessions + records))
}
