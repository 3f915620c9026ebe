//! Schema and connection setup for the SQLite coordination store

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

use crate::Result;

pub(crate) const SESSIONS_TABLE: &str = "sessions";
pub(crate) const OUTPUT_RECORDS_TABLE: &str = "output_records";

/// Table definitions (table name → DDL)
pub(crate) fn create_tables_sql() -> [(&'static str, &'static str); 2] {
    [
        (
            SESSIONS_TABLE,
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'running',
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )",
        ),
        (
            OUTPUT_RECORDS_TABLE,
            "CREATE TABLE IF NOT EXISTS output_records (
                sequence_no INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                output_kind TEXT NOT NULL,
                producer_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        ),
    ]
}

pub(crate) fn create_indexes_sql() -> [&'static str; 3] {
    [
        "CREATE INDEX IF NOT EXISTS idx_records_session_kind
         ON output_records(session_id, output_kind, sequence_no)",
        // At most one complete record per key, enforced by storage as well as by admission
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_one_complete
         ON output_records(session_id, output_kind) WHERE status = 'complete'",
        "CREATE INDEX IF NOT EXISTS idx_sessions_created
         ON sessions(created_at, status)",
    ]
}

/// Open the single write connection and make sure the schema exists
pub(crate) fn open_writer(
    path: &Path,
    busy_timeout: Duration,
    synchronous: &str,
) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;

    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(
            journal_mode = %mode,
            "SQLite refused WAL mode; readers may block on the writer"
        );
    }
    conn.pragma_update(None, "synchronous", synchronous)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    for (table, ddl) in create_tables_sql() {
        conn.execute(ddl, [])?;
        tracing::debug!(table, "ensured table");
    }
    for ddl in create_indexes_sql() {
        conn.execute(ddl, [])?;
    }

    Ok(conn)
}

/// Open a read-only connection against the same database file
pub(crate) fn open_reader(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}
