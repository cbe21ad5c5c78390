// SQLite storage - gpa_summary + courses tables
//
// Free functions take a `&Connection` so they can be used directly (tests,
// one-off tools); `SqliteStorage` wraps an owned connection and implements
// the `Storage` trait on top of them for the persistence worker.

use crate::error::StorageResult;
use crate::records::{now_timestamp, EntryRecord, SummaryRecord};
use crate::storage::Storage;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub fn setup_database(conn: &Connection) -> StorageResult<()> {
    // WAL for crash recovery; in-memory databases silently stay in "memory" mode
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Needed on every connection for the cascade below
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Summary table (one row per saved GPA result)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gpa_summary (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpa REAL NOT NULL,
            credits REAL NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Course table (children, removed together with their summary)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            gpa_summary_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            code TEXT NOT NULL,
            credit REAL NOT NULL,
            teacher1 TEXT,
            teacher2 TEXT,
            grade TEXT NOT NULL,
            FOREIGN KEY (gpa_summary_id) REFERENCES gpa_summary(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_summary ON courses(gpa_summary_id)",
        [],
    )?;

    Ok(())
}

pub fn insert_summary(conn: &Connection, gpa: f64, credits: f64) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO gpa_summary (gpa, credits, timestamp) VALUES (?1, ?2, ?3)",
        params![gpa, credits, now_timestamp()],
    )?;

    let id = conn.last_insert_rowid();
    debug!(id, gpa, credits, "inserted gpa summary");
    Ok(id)
}

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord::persisted(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    ))
}

pub fn get_summary(conn: &Connection, id: i64) -> StorageResult<Option<SummaryRecord>> {
    let summary = conn
        .query_row(
            "SELECT id, gpa, credits, timestamp FROM gpa_summary WHERE id = ?1",
            [id],
            summary_from_row,
        )
        .optional()?;

    Ok(summary)
}

/// Newest first. Rows saved within the same second fall back to id order.
pub fn get_all_summaries(conn: &Connection) -> StorageResult<Vec<SummaryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, gpa, credits, timestamp
         FROM gpa_summary
         ORDER BY timestamp DESC, id DESC",
    )?;

    let summaries = stmt
        .query_map([], summary_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(count = summaries.len(), "fetched gpa summaries");
    Ok(summaries)
}

pub fn delete_summary(conn: &Connection, id: i64) -> StorageResult<bool> {
    let affected = conn.execute("DELETE FROM gpa_summary WHERE id = ?1", [id])?;
    Ok(affected > 0)
}

pub fn update_summary(conn: &Connection, summary: &SummaryRecord) -> StorageResult<bool> {
    let Some(id) = summary.id else {
        return Ok(false);
    };

    let affected = conn.execute(
        "UPDATE gpa_summary SET gpa = ?1, credits = ?2, timestamp = ?3 WHERE id = ?4",
        params![summary.gpa, summary.total_credits, summary.created_at, id],
    )?;

    Ok(affected > 0)
}

/// All entries go in one transaction: either every row lands or none does.
pub fn insert_entries(
    conn: &Connection,
    summary_id: i64,
    entries: &[EntryRecord],
) -> StorageResult<()> {
    let tx = conn.unchecked_transaction()?;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO courses (gpa_summary_id, name, code, credit, teacher1, teacher2, grade)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for entry in entries {
            stmt.execute(params![
                summary_id,
                entry.name,
                entry.code,
                entry.credit_value,
                entry.instructor_primary,
                entry.instructor_secondary,
                entry.grade,
            ])?;
        }
    }

    tx.commit()?;
    debug!(summary_id, count = entries.len(), "inserted courses");
    Ok(())
}

pub fn get_entries(conn: &Connection, summary_id: i64) -> StorageResult<Vec<EntryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT name, code, credit, teacher1, teacher2, grade
         FROM courses
         WHERE gpa_summary_id = ?1
         ORDER BY id",
    )?;

    let entries = stmt
        .query_map([summary_id], |row| {
            Ok(EntryRecord {
                name: row.get(0)?,
                code: row.get(1)?,
                credit_value: row.get(2)?,
                instructor_primary: row.get(3)?,
                instructor_secondary: row.get(4)?,
                grade: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

pub fn delete_entries(conn: &Connection, summary_id: i64) -> StorageResult<usize> {
    let affected = conn.execute("DELETE FROM courses WHERE gpa_summary_id = ?1", [summary_id])?;
    Ok(affected)
}

pub fn count_summaries(conn: &Connection) -> StorageResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM gpa_summary", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// STORAGE IMPLEMENTATION
// ============================================================================

/// [`Storage`] backed by a single SQLite connection.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (creating if needed) a database file and its tables.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> StorageResult<Self> {
        setup_database(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Storage for SqliteStorage {
    fn insert_summary(&mut self, gpa: f64, credits: f64) -> StorageResult<i64> {
        insert_summary(&self.conn, gpa, credits)
    }

    fn fetch_summary(&mut self, id: i64) -> StorageResult<Option<SummaryRecord>> {
        get_summary(&self.conn, id)
    }

    fn fetch_all_summaries(&mut self) -> StorageResult<Vec<SummaryRecord>> {
        get_all_summaries(&self.conn)
    }

    fn delete_summary(&mut self, id: i64) -> StorageResult<bool> {
        delete_summary(&self.conn, id)
    }

    fn update_summary(&mut self, summary: &SummaryRecord) -> StorageResult<bool> {
        update_summary(&self.conn, summary)
    }

    fn insert_entries(&mut self, summary_id: i64, entries: &[EntryRecord]) -> StorageResult<()> {
        insert_entries(&self.conn, summary_id, entries)
    }

    fn fetch_entries(&mut self, summary_id: i64) -> StorageResult<Vec<EntryRecord>> {
        get_entries(&self.conn, summary_id)
    }

    fn delete_entries(&mut self, summary_id: i64) -> StorageResult<usize> {
        delete_entries(&self.conn, summary_id)
    }

    fn count_summaries(&mut self) -> StorageResult<i64> {
        count_summaries(&self.conn)
    }
}
