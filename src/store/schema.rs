//! SQLite DDL for the state store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the state database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Task snapshot -- mirrors TaskRecord fields.
CREATE TABLE IF NOT EXISTS task_records (
    task_id         TEXT PRIMARY KEY,
    list_id         TEXT NOT NULL,
    list_name       TEXT NOT NULL,
    title           TEXT NOT NULL,
    artifact_id     TEXT,
    artifact_url    TEXT,
    event_id        TEXT,
    completed       INTEGER NOT NULL DEFAULT 0,
    due_at          TEXT,                -- wall-clock, no zone
    remote_modified TEXT NOT NULL DEFAULT '',
    needs_artifact  INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,       -- RFC 3339 UTC
    updated_at      TEXT NOT NULL
);

-- Per-list listings must not scan unrelated lists.
CREATE INDEX IF NOT EXISTS idx_records_list_name ON task_records(list_name);

-- Append-only audit trail -- mirrors AuditEntry fields.
CREATE TABLE IF NOT EXISTS audit_log (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    at      TEXT NOT NULL,
    kind    TEXT NOT NULL,       -- snake_case AuditKind variant
    task_id TEXT,
    detail  TEXT NOT NULL,
    success INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at);

-- One weekly review per week; the PRIMARY KEY enforces it.
CREATE TABLE IF NOT EXISTS review_markers (
    week_start TEXT PRIMARY KEY,  -- ISO date of the week's Monday
    event_id   TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the schema version on a fresh database
/// without overwriting an existing one.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version_str = CURRENT_SCHEMA_VERSION.to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![version_str],
    )?;

    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the `schema_meta` table is empty or the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
