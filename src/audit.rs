use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::db::{format_timestamp, parse_column, timestamp_column};
use crate::error::{Result, SyncError};
use crate::models::{AuditLogEntry, AuditStatus};

/// Counters accumulated by one sync run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounts {
    pub inserts: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub categorized: usize,
}

const AUDIT_COLUMNS: &str = "id, connection_id, start_time, end_time, status, inserts, \
     duplicates, skipped, categorized, error_message";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let start_time = timestamp_column(row, 2)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "start_time".into(), rusqlite::types::Type::Null)
    })?;
    Ok(AuditLogEntry {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        start_time,
        end_time: timestamp_column(row, 3)?,
        status: parse_column(row, 4)?,
        inserts: row.get(5)?,
        duplicates: row.get(6)?,
        skipped: row.get(7)?,
        categorized: row.get(8)?,
        error_message: row.get(9)?,
    })
}

pub fn open_entry(conn: &Connection, connection_id: i64, start: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (connection_id, start_time, status) VALUES (?1, ?2, 'running')",
        rusqlite::params![connection_id, format_timestamp(start)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close an open entry. Finalized entries are immutable: returns false and
/// changes nothing when the entry already has an end time.
pub fn finalize_entry(
    conn: &Connection,
    audit_id: i64,
    end: DateTime<Utc>,
    counts: &RunCounts,
    error: Option<&str>,
) -> Result<bool> {
    let status = if error.is_some() {
        AuditStatus::Failed
    } else {
        AuditStatus::Success
    };
    let changed = conn.execute(
        "UPDATE audit_log SET end_time = ?1, status = ?2, inserts = ?3, duplicates = ?4, \
         skipped = ?5, categorized = ?6, error_message = ?7 \
         WHERE id = ?8 AND end_time IS NULL",
        rusqlite::params![
            format_timestamp(end),
            status.as_str(),
            counts.inserts as i64,
            counts.duplicates as i64,
            counts.skipped as i64,
            counts.categorized as i64,
            error,
            audit_id
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_entry(conn: &Connection, audit_id: i64) -> Result<AuditLogEntry> {
    conn.query_row(
        &format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id = ?1"),
        [audit_id],
        row_to_entry,
    )
    .optional()?
    .ok_or_else(|| SyncError::Other(format!("audit entry {audit_id} not found")))
}

/// Newest first.
pub fn list_audit(conn: &Connection, connection_id: i64, limit: usize) -> Result<Vec<AuditLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE connection_id = ?1 \
         ORDER BY start_time DESC, id DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![connection_id, limit as i64], row_to_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fail every entry of a connection that never got an end time.
pub fn fail_open_entries(
    conn: &Connection,
    connection_id: i64,
    message: &str,
    end: DateTime<Utc>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE audit_log SET end_time = ?1, status = 'failed', error_message = ?2 \
         WHERE connection_id = ?3 AND end_time IS NULL",
        rusqlite::params![format_timestamp(end), message, connection_id],
    )?;
    Ok(changed)
}
