//! To-do endpoints: list resolution, task paging, and the two write-backs
//! the engine is allowed (body annotation, completion mark).

use crate::error::Result;
use crate::graph::client::GraphClient;
use crate::model::{RemoteTask, TaskList};
use crate::remote::TaskSource;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::sync::Arc;

pub struct TodoApi {
    client: Arc<GraphClient>,
}

impl TodoApi {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireList {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    id: String,
    title: String,
    status: Option<String>,
    last_modified_date_time: Option<String>,
    body: Option<WireBody>,
    due_date_time: Option<WireDateTimeZone>,
}

#[derive(Debug, Deserialize)]
struct WireBody {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDateTimeZone {
    date_time: Option<String>,
}

fn to_remote(task: WireTask) -> RemoteTask {
    RemoteTask {
        id: task.id,
        title: task.title,
        body: task.body.and_then(|b| b.content).unwrap_or_default(),
        completed: task.status.as_deref() == Some("completed"),
        due: task
            .due_date_time
            .and_then(|d| d.date_time)
            .and_then(|raw| parse_source_datetime(&raw)),
        modified: task.last_modified_date_time.unwrap_or_default(),
    }
}

/// Parses the source's wall-clock timestamps, which carry up to seven
/// fractional-second digits and sometimes a trailing `Z`.
pub(crate) fn parse_source_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

// ---------------------------------------------------------------------------
// TaskSource
// ---------------------------------------------------------------------------

#[async_trait]
impl TaskSource for TodoApi {
    async fn resolve_list(&self, display_name: &str) -> Result<Option<TaskList>> {
        let lists: Vec<WireList> = self.client.get_all("/me/todo/lists").await?;
        let wanted = display_name.trim().to_lowercase();
        Ok(lists
            .into_iter()
            .find(|l| l.display_name.trim().to_lowercase() == wanted)
            .map(|l| TaskList {
                id: l.id,
                display_name: l.display_name,
            }))
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>> {
        let tasks: Vec<WireTask> = self
            .client
            .get_all(&format!("/me/todo/lists/{list_id}/tasks"))
            .await?;
        Ok(tasks.into_iter().map(to_remote).collect())
    }

    async fn update_body(&self, list_id: &str, task_id: &str, body: &str) -> Result<()> {
        let payload = serde_json::json!({
            "body": { "content": body, "contentType": "text" }
        });
        self.client
            .patch(&format!("/me/todo/lists/{list_id}/tasks/{task_id}"), &payload)
            .await
    }

    async fn mark_completed(&self, list_id: &str, task_id: &str) -> Result<()> {
        let payload = serde_json::json!({ "status": "completed" });
        self.client
            .patch(&format!("/me/todo/lists/{list_id}/tasks/{task_id}"), &payload)
            .await
    }
}
