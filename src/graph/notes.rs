//! Note endpoints: notebook/section discovery and page creation.
//!
//! The notebook is located by display name once per process and a section per
//! monitored list is ensured and cached, so steady-state artifact creation is
//! a single page upload plus a link fetch.

use crate::error::{Result, SyncError};
use crate::graph::client::GraphClient;
use crate::model::RemoteTask;
use crate::remote::{ArtifactRef, ArtifactService};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct NotesApi {
    client: Arc<GraphClient>,
    notebook_name: String,
    notebook_id: Mutex<Option<String>>,
    /// list name -> section id, filled on first use.
    sections: Mutex<HashMap<String, String>>,
}

impl NotesApi {
    pub fn new(client: Arc<GraphClient>, notebook_name: impl Into<String>) -> Self {
        Self {
            client,
            notebook_name: notebook_name.into(),
            notebook_id: Mutex::new(None),
            sections: Mutex::new(HashMap::new()),
        }
    }

    async fn notebook_id(&self) -> Result<String> {
        let mut cached = self.notebook_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let path = format!(
            "/me/onenote/notebooks?$filter={}",
            urlencoding::encode(&format!("displayName eq '{}'", self.notebook_name))
        );
        let notebooks: Vec<WireNamed> = self.client.get_all(&path).await?;
        let notebook = notebooks.into_iter().next().ok_or_else(|| {
            SyncError::Config(format!("notebook '{}' not found", self.notebook_name))
        })?;
        debug!(notebook = %self.notebook_name, id = %notebook.id, "resolved notebook");
        *cached = Some(notebook.id.clone());
        Ok(notebook.id)
    }

    /// Finds or creates the section named after the list.
    async fn section_id(&self, list_name: &str) -> Result<String> {
        if let Some(id) = self.sections.lock().await.get(list_name) {
            return Ok(id.clone());
        }

        let notebook_id = self.notebook_id().await?;
        let path = format!(
            "/me/onenote/notebooks/{notebook_id}/sections?$filter={}",
            urlencoding::encode(&format!("displayName eq '{list_name}'"))
        );
        let found: Vec<WireNamed> = self.client.get_all(&path).await?;
        let id = match found.into_iter().next() {
            Some(section) => section.id,
            None => {
                let created: WireNamed = self
                    .client
                    .post(
                        &format!("/me/onenote/notebooks/{notebook_id}/sections"),
                        &serde_json::json!({ "displayName": list_name }),
                    )
                    .await?;
                debug!(section = list_name, id = %created.id, "created section");
                created.id
            }
        };

        self.sections.lock().await.insert(list_name.to_owned(), id.clone());
        Ok(id)
    }

    async fn page_link(&self, page: &WirePage) -> Result<String> {
        if let Some(href) = page
            .links
            .as_ref()
            .and_then(|l| l.one_note_web_url.as_ref())
            .and_then(|u| u.href.clone())
        {
            return Ok(href);
        }
        let fetched: WirePage = self
            .client
            .get(&format!("/me/onenote/pages/{}?$select=links", page.id))
            .await?;
        Ok(fetched
            .links
            .and_then(|l| l.one_note_web_url)
            .and_then(|u| u.href)
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireNamed {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    id: String,
    links: Option<WireLinks>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLinks {
    one_note_web_url: Option<WireHref>,
}

#[derive(Debug, Deserialize)]
struct WireHref {
    href: Option<String>,
}

// ---------------------------------------------------------------------------
// Page construction
// ---------------------------------------------------------------------------

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// XHTML template for a task page: title header, source list, and empty
/// sections to fill in by hand.
fn page_xhtml(title: &str, list_name: &str, created: &str) -> String {
    let title = escape_html(title);
    let list_name = escape_html(list_name);
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
         <title>{title}</title>\n\
         <meta name=\"created\" content=\"{created}\" />\n\
         </head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <p><b>List:</b> {list_name}</p>\n\
         <h2>Objective</h2>\n\
         <p></p>\n\
         <h2>Notes</h2>\n\
         <p></p>\n\
         <h2>Next actions</h2>\n\
         <p></p>\n\
         </body>\n\
         </html>"
    )
}

#[async_trait]
impl ArtifactService for NotesApi {
    async fn create_artifact(&self, list_name: &str, task: &RemoteTask) -> Result<ArtifactRef> {
        let section_id = self.section_id(list_name).await?;
        let body = page_xhtml(&task.title, list_name, &chrono::Utc::now().to_rfc3339());
        let page: WirePage = self
            .client
            .post_xhtml(&format!("/me/onenote/sections/{section_id}/pages"), &body)
            .await?;

        // The page exists at this point. A failed link fetch is not worth an
        // orphaned duplicate on the next cycle, so fall back to an empty URL.
        let url = match self.page_link(&page).await {
            Ok(url) => url,
            Err(e) => {
                warn!(page = %page.id, error = %e, "page created but link fetch failed");
                String::new()
            }
        };

        Ok(ArtifactRef { id: page.id, url })
    }
}
