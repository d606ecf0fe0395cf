//! SQLite-backed state store.
//!
//! Single database file, thread-safe via an internal `Mutex<Connection>`.
//! All writes are serialized; WAL mode keeps concurrent readers out of the
//! writers' way. `close()` takes the connection out of the mutex, so later
//! calls fail instead of touching a half-released handle.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use super::schema::{apply_schema, read_schema_version};
use super::{
    AuditEntry, ReviewMarker, StateStore, TaskRecord, format_due, format_utc, format_week,
    kind_to_str, parse_due, parse_utc, parse_week, str_to_kind,
};
use crate::error::{Result, SyncError};

const RECORD_COLUMNS: &str = "task_id, list_id, list_name, title, artifact_id, artifact_url, \
     event_id, completed, due_at, remote_modified, needs_artifact, created_at, updated_at";

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        apply_schema(&conn).map_err(db_err)?;
        debug!(path = %path.display(), "opened sqlite state store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current schema version from the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        read_schema_version(conn).map_err(db_err)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Store(format!("lock poisoned: {e}")))
    }
}

fn open_conn<'a>(
    guard: &'a std::sync::MutexGuard<'_, Option<Connection>>,
) -> Result<&'a Connection> {
    guard
        .as_ref()
        .ok_or_else(|| SyncError::Store("store is closed".to_owned()))
}

fn db_err(e: rusqlite::Error) -> SyncError {
    SyncError::Store(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM task_records WHERE task_id = ?1");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let mut rows = stmt.query(params![task_id]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(row_to_record(row).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let sql =
            format!("SELECT {RECORD_COLUMNS} FROM task_records ORDER BY list_name, title, task_id");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt.query_map([], row_to_record).map_err(db_err)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r.map_err(db_err)?);
        }
        Ok(records)
    }

    async fn list_for(&self, list_name: &str) -> Result<Vec<TaskRecord>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM task_records WHERE list_name = ?1 ORDER BY title, task_id"
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt.query_map(params![list_name], row_to_record).map_err(db_err)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r.map_err(db_err)?);
        }
        Ok(records)
    }

    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        conn.execute(
            "INSERT OR REPLACE INTO task_records \
             (task_id, list_id, list_name, title, artifact_id, artifact_url, event_id, \
              completed, due_at, remote_modified, needs_artifact, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.task_id,
                record.list_id,
                record.list_name,
                record.title,
                record.artifact_id,
                record.artifact_url,
                record.event_id,
                record.completed,
                record.due.map(format_due),
                record.remote_modified,
                record.needs_artifact,
                format_utc(record.created_at),
                format_utc(record.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let rows = conn
            .execute("DELETE FROM task_records WHERE task_id = ?1", params![task_id])
            .map_err(db_err)?;
        if rows == 0 {
            debug!(task_id, "delete of absent record is a no-op");
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        conn.execute(
            "INSERT INTO audit_log (at, kind, task_id, detail, success) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_utc(entry.at),
                kind_to_str(entry.kind),
                entry.task_id,
                entry.detail,
                entry.success,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let mut stmt = conn
            .prepare(
                "SELECT at, kind, task_id, detail, success FROM audit_log \
                 ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_audit)
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for r in rows {
            entries.push(r.map_err(db_err)?);
        }
        Ok(entries)
    }

    async fn review_marker(&self, week_start: NaiveDate) -> Result<Option<ReviewMarker>> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let mut stmt = conn
            .prepare(
                "SELECT week_start, event_id, created_at FROM review_markers \
                 WHERE week_start = ?1",
            )
            .map_err(db_err)?;
        let mut rows = stmt.query(params![format_week(week_start)]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => {
                let week_str: String = row.get(0).map_err(db_err)?;
                let created_str: String = row.get(2).map_err(db_err)?;
                Ok(Some(ReviewMarker {
                    week_start: parse_week(&week_str).unwrap_or(week_start),
                    event_id: row.get(1).map_err(db_err)?,
                    created_at: parse_utc(&created_str),
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_review_marker(&self, week_start: NaiveDate, event_id: &str) -> Result<()> {
        let guard = self.lock()?;
        let conn = open_conn(&guard)?;
        let result = conn.execute(
            "INSERT INTO review_markers (week_start, event_id, created_at) VALUES (?1, ?2, ?3)",
            params![format_week(week_start), event_id, format_utc(Utc::now())],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SyncError::AlreadyExists(format!(
                    "review marker for week {week_start}"
                )))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
                warn!(error = %e, "optimize on close failed");
            }
            if let Err((_, e)) = conn.close() {
                return Err(SyncError::Store(format!("close failed: {e}")));
            }
            debug!(path = %self.path.display(), "closed sqlite state store");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row conversion helpers
// ---------------------------------------------------------------------------

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let due_str: Option<String> = row.get(8)?;
    let created_str: String = row.get(11)?;
    let updated_str: String = row.get(12)?;

    Ok(TaskRecord {
        task_id: row.get(0)?,
        list_id: row.get(1)?,
        list_name: row.get(2)?,
        title: row.get(3)?,
        artifact_id: row.get(4)?,
        artifact_url: row.get(5)?,
        event_id: row.get(6)?,
        completed: row.get(7)?,
        due: due_str.as_deref().and_then(parse_due),
        remote_modified: row.get(9)?,
        needs_artifact: row.get(10)?,
        created_at: parse_utc(&created_str),
        updated_at: parse_utc(&updated_str),
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let at_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    Ok(AuditEntry {
        at: parse_utc(&at_str),
        kind: str_to_kind(&kind_str),
        task_id: row.get(2)?,
        detail: row.get(3)?,
        success: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
