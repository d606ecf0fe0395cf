//! Local state: the task snapshot, the audit trail and the weekly-review
//! markers suppressing duplicate review events.
//!
//! Two interchangeable backends implement [`StateStore`]: an embedded SQLite
//! file for single-machine use and a cloud table service for shared state.
//! The engine only ever holds the trait object.

pub mod schema;
pub mod sqlite;
pub mod table;

pub use sqlite::SqliteStore;
pub use table::TableStore;

use crate::config::{StoreBackend, StoreConfig, SyncConfig};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Snapshot of one remote task as of the last completed action sequence,
/// including references to the derived artifact and event.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub list_id: String,
    pub list_name: String,
    pub title: String,
    /// Note artifact identity, set once creation succeeded.
    pub artifact_id: Option<String>,
    /// Clickable artifact link annotated into the task body.
    pub artifact_url: Option<String>,
    /// Calendar event identity, set once creation succeeded.
    pub event_id: Option<String>,
    pub completed: bool,
    pub due: Option<NaiveDateTime>,
    /// Opaque last-modified marker observed on the remote.
    pub remote_modified: String,
    /// Classifier verdict, decided once per task lifetime.
    pub needs_artifact: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    TaskNew,
    TaskModified,
    TaskRemoved,
    ArtifactCreated,
    BodyAnnotated,
    EventCreated,
    EventUpdated,
    EventDeleted,
    ReviewCreated,
    CycleError,
}

/// One append-only audit row. Every dispatched action writes exactly one,
/// success or failure.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub task_id: Option<String>,
    pub detail: String,
    pub success: bool,
}

/// Marker proving a weekly review event exists for a given week.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewMarker {
    /// Monday of the review's week.
    pub week_start: NaiveDate,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Persistence contract shared by both backends.
///
/// Absence is never an error: `get` returns `None`, listings return empty
/// vectors, and `delete` of a missing record succeeds. The one deliberate
/// exception is [`StateStore::save_review_marker`], which must refuse a
/// duplicate week with [`SyncError::AlreadyExists`] so concurrent processes
/// cannot both schedule a review.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Every record, ordered by list name then title.
    async fn list(&self) -> Result<Vec<TaskRecord>>;

    /// Records for one list, without scanning unrelated lists.
    async fn list_for(&self, list_name: &str) -> Result<Vec<TaskRecord>>;

    /// Inserts or fully replaces by task identity.
    async fn upsert(&self, record: &TaskRecord) -> Result<()>;

    async fn delete(&self, task_id: &str) -> Result<()>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent audit entries, newest first.
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    async fn review_marker(&self, week_start: NaiveDate) -> Result<Option<ReviewMarker>>;

    /// Fails with [`SyncError::AlreadyExists`] when the week already has a
    /// marker; the stored event id is the first writer's.
    async fn save_review_marker(&self, week_start: NaiveDate, event_id: &str) -> Result<()>;

    /// Releases backend resources. Further calls fail; a second `close` is a
    /// no-op.
    async fn close(&self) -> Result<()>;
}

/// Opens the backend selected in config.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StoreBackend::Sqlite => {
            let path = config
                .sqlite_path
                .clone()
                .unwrap_or_else(|| SyncConfig::default_data_dir().join("state.db"));
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        StoreBackend::Table => Ok(Arc::new(TableStore::connect(&config.table).await?)),
    }
}

// ---------------------------------------------------------------------------
// Enum <-> string conversions (shared by both backends)
// ---------------------------------------------------------------------------

pub(crate) fn kind_to_str(kind: AuditKind) -> &'static str {
    match kind {
        AuditKind::TaskNew => "task_new",
        AuditKind::TaskModified => "task_modified",
        AuditKind::TaskRemoved => "task_removed",
        AuditKind::ArtifactCreated => "artifact_created",
        AuditKind::BodyAnnotated => "body_annotated",
        AuditKind::EventCreated => "event_created",
        AuditKind::EventUpdated => "event_updated",
        AuditKind::EventDeleted => "event_deleted",
        AuditKind::ReviewCreated => "review_created",
        AuditKind::CycleError => "cycle_error",
    }
}

pub(crate) fn str_to_kind(s: &str) -> AuditKind {
    match s {
        "task_new" => AuditKind::TaskNew,
        "task_modified" => AuditKind::TaskModified,
        "task_removed" => AuditKind::TaskRemoved,
        "artifact_created" => AuditKind::ArtifactCreated,
        "body_annotated" => AuditKind::BodyAnnotated,
        "event_created" => AuditKind::EventCreated,
        "event_updated" => AuditKind::EventUpdated,
        "event_deleted" => AuditKind::EventDeleted,
        "review_created" => AuditKind::ReviewCreated,
        _ => AuditKind::CycleError, // safe fallback
    }
}

// ---------------------------------------------------------------------------
// Timestamp persistence helpers (shared by both backends)
// ---------------------------------------------------------------------------

pub(crate) fn format_due(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

pub(crate) fn parse_due(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

pub(crate) fn format_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH) // safe fallback
}

pub(crate) fn format_week(week_start: NaiveDate) -> String {
    week_start.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_week(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}
