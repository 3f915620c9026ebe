//! Read side of the SQLite coordination store
//!
//! Reads run on the blocking pool with their own read-only connections.
//! Under WAL a reader sees the last commit that finished before its
//! transaction began, which is what gives read-after-ack.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::time::Duration;

use super::schema;
use crate::domain::{OutputKind, OutputRecord, RecordStatus, Session, SessionId, SessionStatus};
use crate::{Result, StorageError};

/// Idle read-only connections, opened lazily
pub(crate) struct ReaderPool {
    path: PathBuf,
    busy_timeout: Duration,
    max_idle: usize,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    pub(crate) fn new(path: PathBuf, busy_timeout: Duration, max_idle: usize) -> Self {
        Self {
            path,
            busy_timeout,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        schema::open_reader(&self.path, self.busy_timeout)
    }

    pub(crate) fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

const RECORD_COLUMNS: &str =
    "sequence_no, session_id, output_kind, producer_id, status, payload, created_at";

/// Row image before enum/JSON decoding
struct RawRecord {
    sequence_no: i64,
    session_id: String,
    output_kind: String,
    producer_id: String,
    status: String,
    payload: String,
    created_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence_no: row.get(0)?,
            session_id: row.get(1)?,
            output_kind: row.get(2)?,
            producer_id: row.get(3)?,
            status: row.get(4)?,
            payload: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<OutputRecord> {
        Ok(OutputRecord {
            session_id: SessionId::from(self.session_id),
            output_kind: OutputKind::from_str(&self.output_kind)?,
            payload: serde_json::from_str(&self.payload)?,
            producer_id: self.producer_id,
            status: RecordStatus::from_str(&self.status)?,
            created_at: from_millis(self.created_at)?,
            sequence_no: Some(self.sequence_no),
        })
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::serialization(format!("Invalid timestamp: {}", ms)))
}

pub(crate) fn latest_record(
    conn: &Connection,
    session_id: &SessionId,
    output_kind: OutputKind,
) -> Result<Option<OutputRecord>> {
    let sql = format!(
        "SELECT {} FROM output_records
         WHERE session_id = ?1 AND output_kind = ?2
         ORDER BY sequence_no DESC LIMIT 1",
        RECORD_COLUMNS
    );
    let raw = conn
        .query_row(
            &sql,
            params![session_id.as_str(), output_kind.as_str()],
            RawRecord::from_row,
        )
        .optional()?;
    raw.map(RawRecord::into_record).transpose()
}

pub(crate) fn latest_per_kind(
    conn: &Connection,
    session_id: &SessionId,
) -> Result<Vec<OutputRecord>> {
    let sql = format!(
        "SELECT {} FROM output_records
         WHERE sequence_no IN (
             SELECT MAX(sequence_no) FROM output_records
             WHERE session_id = ?1 GROUP BY output_kind
         )
         ORDER BY sequence_no",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![session_id.as_str()], RawRecord::from_row)?;

    let mut records = Vec::new();
    for raw in rows {
        records.push(raw?.into_record()?);
    }
    Ok(records)
}

pub(crate) fn session(conn: &Connection, session_id: &SessionId) -> Result<Option<Session>> {
    let raw = conn
        .query_row(
            "SELECT status, created_at, completed_at FROM sessions WHERE session_id = ?1",
            params![session_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;

    raw.map(|(status, created_at, completed_at)| {
        Ok(Session {
            id: session_id.clone(),
            status: SessionStatus::from_str(&status)?,
            created_at: from_millis(created_at)?,
            completed_at: completed_at.map(from_millis).transpose()?,
        })
    })
    .transpose()
}
