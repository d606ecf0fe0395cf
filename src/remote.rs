//! Collaborator contracts the engine drives side effects through.
//!
//! The engine only ever sees these traits; the `graph` module provides the
//! production implementations and the integration tests substitute fakes.

use crate::error::Result;
use crate::model::{RemoteTask, TaskList};
use async_trait::async_trait;
use chrono::NaiveDateTime;

/// Reference to a created note artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub id: String,
    /// Human-clickable link, annotated back into the task body.
    pub url: String,
}

/// Payload for a new calendar event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub subject: String,
    pub body: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Partial update to an existing calendar event. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub subject: Option<String>,
    pub window: Option<(NaiveDateTime, NaiveDateTime)>,
}

impl EventPatch {
    pub fn subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            window: None,
        }
    }

    pub fn window(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            subject: None,
            window: Some((start, end)),
        }
    }
}

/// The remote to-do service. The engine treats it as the source of truth and
/// only writes back through the two explicit update operations.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Finds a list by display name. `Ok(None)` when no such list exists.
    async fn resolve_list(&self, display_name: &str) -> Result<Option<TaskList>>;

    /// All tasks currently on the list, every page merged.
    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>>;

    /// Replaces the task body (used to annotate the artifact link).
    async fn update_body(&self, list_id: &str, task_id: &str, body: &str) -> Result<()>;

    /// Marks the task completed on the remote.
    async fn mark_completed(&self, list_id: &str, task_id: &str) -> Result<()>;
}

/// The note-taking service. Creation is not idempotent on the remote, so the
/// engine never retries a create within a cycle; repairs happen on later
/// cycles when no artifact reference was persisted.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn create_artifact(&self, list_name: &str, task: &RemoteTask) -> Result<ArtifactRef>;
}

/// The calendar service. Deleting an event that is already gone counts as
/// success.
#[async_trait]
pub trait EventService: Send + Sync {
    /// Creates an event and returns its identity.
    async fn create_event(&self, event: &NewEvent) -> Result<String>;

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> Result<()>;

    async fn delete_event(&self, event_id: &str) -> Result<()>;
}
