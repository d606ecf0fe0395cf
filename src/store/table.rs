//! Cloud table state store over the Azure Table REST API.
//!
//! Entities are flat JSON with `PartitionKey`/`RowKey`:
//!
//! * task records: partition = list name, row = task id, so one list scans
//!   as a single partition query;
//! * audit entries: partition `log`, row = reverse-timestamp key, so lexical
//!   order is newest first;
//! * review markers: partition `review`, row = ISO week-start date, so the
//!   POST insert enforces at most one marker per week.
//!
//! Authentication is a pre-signed SAS query string appended to every URL.
//! A rejected SAS cannot be refreshed, so 401/403 fails fast instead of
//! burning retries.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    AuditEntry, ReviewMarker, StateStore, TaskRecord, format_due, format_utc, format_week,
    kind_to_str, parse_due, parse_utc, parse_week, str_to_kind,
};
use crate::config::TableConfig;
use crate::error::{Result, SyncError};
use crate::graph::{RetryPolicy, client::parse_retry_after};

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Row keys sort ascending; subtracting from this constant flips the order.
const REVERSE_EPOCH: i64 = 9_999_999_999;

const AUDIT_PARTITION: &str = "log";
const REVIEW_PARTITION: &str = "review";

pub struct TableStore {
    http: reqwest::Client,
    endpoint: String,
    sas: String,
    records_table: String,
    audit_table: String,
    reviews_table: String,
    retry: RetryPolicy,
}

impl fmt::Debug for TableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableStore")
            .field("endpoint", &self.endpoint)
            .field("records_table", &self.records_table)
            .field("audit_table", &self.audit_table)
            .field("reviews_table", &self.reviews_table)
            .finish_non_exhaustive()
    }
}

impl TableStore {
    /// Connect to the table service and make sure all three tables exist.
    pub async fn connect(config: &TableConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(SyncError::Config(
                "table endpoint is not configured".to_owned(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Transient(format!("failed to build HTTP client: {e}")))?;

        // Table names must be alphanumeric, so the prefix is glued on bare.
        let prefix = config.table_prefix.trim();
        let store = Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            sas: config.sas_token.trim_start_matches('?').to_owned(),
            records_table: format!("{prefix}records"),
            audit_table: format!("{prefix}audit"),
            reviews_table: format!("{prefix}reviews"),
            retry: RetryPolicy::default(),
        };

        for table in [
            store.records_table.clone(),
            store.audit_table.clone(),
            store.reviews_table.clone(),
        ] {
            store.ensure_table(&table).await?;
        }
        Ok(store)
    }

    async fn ensure_table(&self, name: &str) -> Result<()> {
        let body = serde_json::json!({ "TableName": name });
        match self.request(Method::POST, "Tables", Some(&body)).await {
            Ok(_) => {
                debug!(table = name, "created table");
                Ok(())
            }
            Err(SyncError::Api { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn url(&self, resource: &str) -> String {
        if self.sas.is_empty() {
            format!("{}/{}", self.endpoint, resource)
        } else {
            let sep = if resource.contains('?') { '&' } else { '?' };
            format!("{}/{}{}{}", self.endpoint, resource, sep, self.sas)
        }
    }

    /// One service call with bounded retries for transient failures.
    async fn request(
        &self,
        method: Method,
        resource: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = self.url(resource);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Accept", "application/json;odata=nometadata")
                .header("x-ms-version", "2019-02-02")
                .header("DataServiceVersion", "3.0;NetFx");
            if let Some(json) = body {
                req = req.json(json);
            }
            if method == Method::DELETE {
                req = req.header("If-Match", "*");
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(SyncError::Transient(format!(
                            "table request failed after {attempt} attempts: {e}"
                        )));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, "table request failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SyncError::Auth(format!(
                    "table credentials rejected (status {})",
                    status.as_u16()
                )));
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.retry.max_attempts {
                    return Err(SyncError::Transient(format!(
                        "table still throttled after {attempt} attempts"
                    )));
                }
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok());
                let secs = parse_retry_after(retry_after);
                warn!(attempt, retry_after_secs = secs, "table throttled, waiting");
                tokio::time::sleep(Duration::from_secs(secs)).await;
                continue;
            }

            if status.is_server_error() {
                if attempt >= self.retry.max_attempts {
                    return Err(SyncError::Transient(format!(
                        "table error {} after {attempt} attempts",
                        status.as_u16()
                    )));
                }
                let delay = self.retry.delay_for_attempt(attempt);
                warn!(attempt, status = status.as_u16(), "table server error, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }

            let message = extract_table_error(&response.text().await.unwrap_or_default());
            return Err(SyncError::Api {
                status: status.as_u16(),
                message,
            });
        }
    }

    /// Query `table`, following server continuation headers to the end.
    async fn query_all<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: Option<&str>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut continuation: Option<(String, String)> = None;

        loop {
            let mut params = Vec::new();
            if let Some(f) = filter {
                params.push(format!("$filter={}", urlencoding::encode(f)));
            }
            if let Some((next_pk, next_rk)) = &continuation {
                params.push(format!("NextPartitionKey={}", urlencoding::encode(next_pk)));
                if !next_rk.is_empty() {
                    params.push(format!("NextRowKey={}", urlencoding::encode(next_rk)));
                }
            }
            let mut resource = format!("{table}()");
            if !params.is_empty() {
                resource.push('?');
                resource.push_str(&params.join("&"));
            }

            let response = self.request(Method::GET, &resource, None).await?;
            let next = continuation_of(response.headers());
            let page: EntityPage<T> = parse_entities(response).await?;
            items.extend(page.value);

            match next {
                Some(c) => continuation = Some(c),
                None => return Ok(items),
            }
        }
    }

    async fn find_record_entity(&self, task_id: &str) -> Result<Option<RecordEntity>> {
        let filter = format!("RowKey eq {}", odata_str(task_id));
        let mut found: Vec<RecordEntity> =
            self.query_all(&self.records_table, Some(&filter)).await?;
        Ok(found.drain(..).next())
    }
}

#[async_trait]
impl StateStore for TableStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .find_record_entity(task_id)
            .await?
            .map(entity_to_record))
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let entities: Vec<RecordEntity> = self.query_all(&self.records_table, None).await?;
        let mut records: Vec<TaskRecord> = entities.into_iter().map(entity_to_record).collect();
        records.sort_by(|a, b| {
            (&a.list_name, &a.title, &a.task_id).cmp(&(&b.list_name, &b.title, &b.task_id))
        });
        Ok(records)
    }

    async fn list_for(&self, list_name: &str) -> Result<Vec<TaskRecord>> {
        let filter = format!("PartitionKey eq {}", odata_str(list_name));
        let entities: Vec<RecordEntity> =
            self.query_all(&self.records_table, Some(&filter)).await?;
        let mut records: Vec<TaskRecord> = entities.into_iter().map(entity_to_record).collect();
        records.sort_by(|a, b| (&a.title, &a.task_id).cmp(&(&b.title, &b.task_id)));
        Ok(records)
    }

    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let entity = record_to_entity(record);
        let resource = entity_resource(&self.records_table, &record.list_name, &record.task_id);
        let body = serde_json::to_value(&entity)
            .map_err(|e| SyncError::Store(format!("failed to encode record: {e}")))?;
        self.request(Method::PUT, &resource, Some(&body)).await?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        // The partition key is the list name, so absent a record we cannot
        // address the entity directly.
        let Some(entity) = self.find_record_entity(task_id).await? else {
            debug!(task_id, "delete of absent record is a no-op");
            return Ok(());
        };
        let resource = entity_resource(
            &self.records_table,
            &entity.partition_key,
            &entity.row_key,
        );
        match self.request(Method::DELETE, &resource, None).await {
            Ok(_) => Ok(()),
            Err(SyncError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let entity = AuditEntity {
            partition_key: AUDIT_PARTITION.to_owned(),
            row_key: reverse_row_key(entry.at),
            at: format_utc(entry.at),
            kind: kind_to_str(entry.kind).to_owned(),
            task_id: entry.task_id.clone(),
            detail: entry.detail.clone(),
            success: entry.success,
        };
        let body = serde_json::to_value(&entity)
            .map_err(|e| SyncError::Store(format!("failed to encode audit entry: {e}")))?;
        self.request(Method::POST, &self.audit_table, Some(&body))
            .await?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        // Reverse-timestamp row keys make the partition's natural order
        // newest first, so $top takes the most recent entries.
        let resource = format!(
            "{}()?$top={}&$filter={}",
            self.audit_table,
            limit,
            urlencoding::encode(&format!("PartitionKey eq {}", odata_str(AUDIT_PARTITION)))
        );
        let response = self.request(Method::GET, &resource, None).await?;
        let page: EntityPage<AuditEntity> = parse_entities(response).await?;
        Ok(page.value.into_iter().map(entity_to_audit).collect())
    }

    async fn review_marker(&self, week_start: NaiveDate) -> Result<Option<ReviewMarker>> {
        let resource = entity_resource(
            &self.reviews_table,
            REVIEW_PARTITION,
            &format_week(week_start),
        );
        match self.request(Method::GET, &resource, None).await {
            Ok(response) => {
                let entity: MarkerEntity = parse_entities(response).await?;
                Ok(Some(ReviewMarker {
                    week_start: parse_week(&entity.row_key).unwrap_or(week_start),
                    event_id: entity.event_id,
                    created_at: parse_utc(&entity.created_at),
                }))
            }
            Err(SyncError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_review_marker(&self, week_start: NaiveDate, event_id: &str) -> Result<()> {
        let entity = MarkerEntity {
            partition_key: REVIEW_PARTITION.to_owned(),
            row_key: format_week(week_start),
            event_id: event_id.to_owned(),
            created_at: format_utc(Utc::now()),
        };
        let body = serde_json::to_value(&entity)
            .map_err(|e| SyncError::Store(format!("failed to encode review marker: {e}")))?;
        match self
            .request(Method::POST, &self.reviews_table, Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(SyncError::Api { status: 409, .. }) => Err(SyncError::AlreadyExists(format!(
                "review marker for week {week_start}"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        // Stateless over HTTP; nothing to release.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire entities
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EntityPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordEntity {
    partition_key: String,
    row_key: String,
    list_id: String,
    title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_at: Option<String>,
    #[serde(default)]
    remote_modified: String,
    needs_artifact: bool,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuditEntity {
    partition_key: String,
    row_key: String,
    at: String,
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
    #[serde(default)]
    detail: String,
    success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MarkerEntity {
    partition_key: String,
    row_key: String,
    event_id: String,
    created_at: String,
}

fn record_to_entity(record: &TaskRecord) -> RecordEntity {
    RecordEntity {
        partition_key: record.list_name.clone(),
        row_key: record.task_id.clone(),
        list_id: record.list_id.clone(),
        title: record.title.clone(),
        artifact_id: record.artifact_id.clone(),
        artifact_url: record.artifact_url.clone(),
        event_id: record.event_id.clone(),
        completed: record.completed,
        due_at: record.due.map(format_due),
        remote_modified: record.remote_modified.clone(),
        needs_artifact: record.needs_artifact,
        created_at: format_utc(record.created_at),
        updated_at: format_utc(record.updated_at),
    }
}

fn entity_to_record(entity: RecordEntity) -> TaskRecord {
    TaskRecord {
        task_id: entity.row_key,
        list_id: entity.list_id,
        list_name: entity.partition_key,
        title: entity.title,
        artifact_id: entity.artifact_id,
        artifact_url: entity.artifact_url,
        event_id: entity.event_id,
        completed: entity.completed,
        due: entity.due_at.as_deref().and_then(parse_due),
        remote_modified: entity.remote_modified,
        needs_artifact: entity.needs_artifact,
        created_at: parse_utc(&entity.created_at),
        updated_at: parse_utc(&entity.updated_at),
    }
}

fn entity_to_audit(entity: AuditEntity) -> AuditEntry {
    AuditEntry {
        at: parse_utc(&entity.at),
        kind: str_to_kind(&entity.kind),
        task_id: entity.task_id,
        detail: entity.detail,
        success: entity.success,
    }
}

// ---------------------------------------------------------------------------
// Addressing helpers
// ---------------------------------------------------------------------------

/// Quote a value for an OData `$filter` expression.
fn odata_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Resource path addressing one entity by its keys.
fn entity_resource(table: &str, partition_key: &str, row_key: &str) -> String {
    format!(
        "{table}(PartitionKey='{}',RowKey='{}')",
        urlencoding::encode(&partition_key.replace('\'', "''")),
        urlencoding::encode(&row_key.replace('\'', "''")),
    )
}

/// Descending row key from a timestamp plus a uniquifier.
fn reverse_row_key(at: DateTime<Utc>) -> String {
    let epoch = at.timestamp().clamp(0, REVERSE_EPOCH);
    format!("{:010}-{}", REVERSE_EPOCH - epoch, Uuid::new_v4().simple())
}

fn continuation_of(headers: &reqwest::header::HeaderMap) -> Option<(String, String)> {
    let next_pk = headers
        .get("x-ms-continuation-NextPartitionKey")
        .and_then(|v| v.to_str().ok())?
        .to_owned();
    let next_rk = headers
        .get("x-ms-continuation-NextRowKey")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    Some((next_pk, next_rk))
}

async fn parse_entities<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    response.json::<T>().await.map_err(|e| SyncError::Store(format!(
        "invalid table response (status {}): {e}",
        status.as_u16()
    )))
}

fn extract_table_error(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("odata.error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.get("value"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn odata_str_doubles_quotes() {
        assert_eq!(odata_str("Hoy"), "'Hoy'");
        assert_eq!(odata_str("l'istesso"), "'l''istesso'");
    }

    #[test]
    fn entity_resource_encodes_keys() {
        let resource = entity_resource("trecords", "Esta semana", "task-1");
        assert_eq!(resource, "trecords(PartitionKey='Esta%20semana',RowKey='task-1')");
    }

    #[test]
    fn reverse_row_key_orders_newest_first() {
        let older = Utc.with_ymd_and_hms(2025, 1, 18, 12, 0, 0).single().expect("time");
        let newer = Utc.with_ymd_and_hms(2025, 1, 18, 12, 0, 1).single().expect("time");
        let older_key = reverse_row_key(older);
        let newer_key = reverse_row_key(newer);
        // Lexical order: newer timestamps produce smaller keys.
        assert!(newer_key < older_key);
    }

    #[test]
    fn record_round_trips_through_entity() {
        let at = Utc.with_ymd_and_hms(2025, 1, 18, 12, 0, 0).single().expect("time");
        let record = TaskRecord {
            task_id: "t1".to_owned(),
            list_id: "id-hoy".to_owned(),
            list_name: "Hoy".to_owned(),
            title: "Preparar informe".to_owned(),
            artifact_id: Some("page-1".to_owned()),
            artifact_url: None,
            event_id: Some("ev-1".to_owned()),
            completed: false,
            due: NaiveDate::from_ymd_opt(2025, 1, 20).and_then(|d| d.and_hms_opt(0, 0, 0)),
            remote_modified: "rev-3".to_owned(),
            needs_artifact: true,
            created_at: at,
            updated_at: at,
        };

        let entity = record_to_entity(&record);
        assert_eq!(entity.partition_key, "Hoy");
        assert_eq!(entity.row_key, "t1");

        let back = entity_to_record(entity);
        assert_eq!(back, record);
    }

    #[test]
    fn entity_json_uses_pascal_case_keys() {
        let entity = MarkerEntity {
            partition_key: REVIEW_PARTITION.to_owned(),
            row_key: "2025-01-06".to_owned(),
            event_id: "ev-1".to_owned(),
            created_at: "2025-01-06T00:00:00+00:00".to_owned(),
        };
        let json = serde_json::to_value(&entity).expect("serialize");
        assert_eq!(json["PartitionKey"], "review");
        assert_eq!(json["RowKey"], "2025-01-06");
        assert_eq!(json["EventId"], "ev-1");
    }

    #[test]
    fn record_entity_tolerates_service_metadata() {
        let raw = r#"{
            "odata.etag": "W/\"datetime'2025-01-18T12%3A00%3A00Z'\"",
            "Timestamp": "2025-01-18T12:00:00Z",
            "PartitionKey": "Hoy",
            "RowKey": "t1",
            "ListId": "id-hoy",
            "Title": "Pagar luz",
            "Completed": false,
            "NeedsArtifact": false,
            "CreatedAt": "2025-01-18T12:00:00+00:00",
            "UpdatedAt": "2025-01-18T12:00:00+00:00"
        }"#;
        let entity: RecordEntity = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(entity.title, "Pagar luz");
        assert!(entity.artifact_id.is_none());
        assert_eq!(entity.remote_modified, "");
    }

    #[test]
    fn table_error_body_is_unwrapped() {
        let body = r#"{"odata.error":{"code":"EntityAlreadyExists","message":{"lang":"en-US","value":"The specified entity already exists."}}}"#;
        assert_eq!(extract_table_error(body), "The specified entity already exists.");
        assert_eq!(extract_table_error("plain text"), "plain text");
    }
}
