//! Domain types shared by the task source, the diff and the engine.
//!
//! These carry no transport details. The remote adapters map their wire
//! formats into these structs before anything else sees them.

use chrono::NaiveDateTime;

/// A to-do list as reported by the remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskList {
    pub id: String,
    pub display_name: String,
}

/// One task as observed on the remote source during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub id: String,
    pub title: String,
    /// Plain-text body content, empty when the task has none.
    pub body: String,
    pub completed: bool,
    /// Due timestamp in the source's wall-clock, when set.
    pub due: Option<NaiveDateTime>,
    /// Opaque last-modified marker. Compared for equality only; never parsed.
    pub modified: String,
}

impl RemoteTask {
    /// Minimal constructor used by adapters and tests; optional fields start
    /// empty and are filled in afterwards.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            completed: false,
            due: None,
            modified: String::new(),
        }
    }

    pub fn with_modified(mut self, marker: impl Into<String>) -> Self {
        self.modified = marker.into();
        self
    }

    pub fn with_due(mut self, due: NaiveDateTime) -> Self {
        self.due = Some(due);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}
