//! Calendar endpoints: event create/update/delete.

use crate::error::{Result, SyncError};
use crate::graph::client::GraphClient;
use crate::remote::{EventPatch, EventService, NewEvent};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub struct CalendarApi {
    client: Arc<GraphClient>,
    timezone: String,
}

impl CalendarApi {
    pub fn new(client: Arc<GraphClient>, timezone: impl Into<String>) -> Self {
        Self {
            client,
            timezone: timezone.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
}

fn wire_datetime(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn event_payload(event: &NewEvent, timezone: &str) -> serde_json::Value {
    serde_json::json!({
        "subject": event.subject,
        "body": { "contentType": "text", "content": event.body },
        "start": { "dateTime": wire_datetime(event.start), "timeZone": timezone },
        "end": { "dateTime": wire_datetime(event.end), "timeZone": timezone },
    })
}

fn patch_payload(patch: &EventPatch, timezone: &str) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    if let Some(subject) = &patch.subject {
        body.insert("subject".to_owned(), serde_json::json!(subject));
    }
    if let Some((start, end)) = patch.window {
        body.insert(
            "start".to_owned(),
            serde_json::json!({ "dateTime": wire_datetime(start), "timeZone": timezone }),
        );
        body.insert(
            "end".to_owned(),
            serde_json::json!({ "dateTime": wire_datetime(end), "timeZone": timezone }),
        );
    }
    serde_json::Value::Object(body)
}

#[async_trait]
impl EventService for CalendarApi {
    async fn create_event(&self, event: &NewEvent) -> Result<String> {
        let created: WireEvent = self
            .client
            .post("/me/events", &event_payload(event, &self.timezone))
            .await?;
        debug!(subject = %event.subject, id = %created.id, "created event");
        Ok(created.id)
    }

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> Result<()> {
        self.client
            .patch(
                &format!("/me/events/{event_id}"),
                &patch_payload(patch, &self.timezone),
            )
            .await
    }

    async fn delete_event(&self, event_id: &str) -> Result<()> {
        match self.client.delete(&format!("/me/events/{event_id}")).await {
            Ok(()) => Ok(()),
            // Already gone counts as deleted.
            Err(SyncError::Api { status: 404, .. }) => {
                debug!(event_id, "event already absent on delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
