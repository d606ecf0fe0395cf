//! Resilient HTTP client for the remote API.
//!
//! Every request goes through one bounded retry loop: transport errors and
//! 5xx responses back off exponentially with jitter, 429 honors the server's
//! `Retry-After`, and a 401 triggers a single credential refresh per logical
//! request. Collection fetches follow the `@odata.nextLink` cursor and fail
//! as a whole if any page fails, so callers never see a partial collection.

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::graph::auth::TokenProvider;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub(crate) const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
pub(crate) const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fallback wait when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per logical request (1 = no retries).
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (caps exponential growth).
    pub max_delay_ms: u64,
    /// Backoff multiplier (2.0 for doubling).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before retrying after the given attempt, 1-based.
    ///
    /// Formula: min(base * multiplier^(attempt-1), max_delay) + jitter,
    /// where jitter is a random value between 0 and 10% of the delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let base = self.base_delay_ms as f64;
        let exp = self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay = (base * exp).min(self.max_delay_ms as f64);

        let jitter = delay * (rand::random::<f64>() * 0.1);
        Duration::from_millis((delay + jitter) as u64)
    }
}

impl From<&ApiConfig> for RetryPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

enum Payload<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Xhtml(&'a str),
}

/// Paged collection envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ListPage<T> {
    #[serde(default)]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish()
    }
}

impl GraphClient {
    pub fn new(config: &ApiConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            tokens,
            retry: RetryPolicy::from(config),
        })
    }

    /// Fetches one resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.execute(reqwest::Method::GET, path, Payload::Empty).await?;
        parse_json(response).await
    }

    /// Fetches a whole collection, following the continuation cursor until the
    /// remote reports no further page. Page order is preserved.
    pub async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(path.to_owned());
        while let Some(current) = next {
            let page: ListPage<T> = self.get(&current).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self.execute(reqwest::Method::POST, path, Payload::Json(body)).await?;
        parse_json(response).await
    }

    /// POST with an XHTML payload (note page uploads).
    pub async fn post_xhtml<T: DeserializeOwned>(&self, path: &str, body: &str) -> Result<T> {
        let response = self.execute(reqwest::Method::POST, path, Payload::Xhtml(body)).await?;
        parse_json(response).await
    }

    pub async fn patch(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        self.execute(reqwest::Method::PATCH, path, Payload::Json(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.execute(reqwest::Method::DELETE, path, Payload::Empty).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_owned()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// One logical request: bounded retries, Retry-After compliance, and at
    /// most one credential refresh.
    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: Payload<'_>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut reauthorized = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let token = self.tokens.token().await?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {token}"));
            request = match payload {
                Payload::Empty => request,
                Payload::Json(body) => request.json(body),
                Payload::Xhtml(body) => request
                    .header("Content-Type", "application/xhtml+xml")
                    .body(body.to_owned()),
            };

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(SyncError::Transient(format!(
                            "{method} {url}: {e} (after {attempt} attempts)"
                        )));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%url, error = %e, ?delay, "transport error, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            match status.as_u16() {
                401 => {
                    if reauthorized {
                        return Err(SyncError::Auth(format!(
                            "{method} {url}: still unauthorized after refresh"
                        )));
                    }
                    warn!(%url, "unauthorized, refreshing credentials");
                    self.tokens.refresh().await?;
                    reauthorized = true;
                }
                429 => {
                    if attempt >= self.retry.max_attempts {
                        return Err(SyncError::Transient(format!(
                            "{method} {url}: rate limited (after {attempt} attempts)"
                        )));
                    }
                    let wait = parse_retry_after(
                        response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok()),
                    );
                    warn!(%url, wait, "rate limited, honoring retry-after");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                s if status.is_server_error() => {
                    let message = read_error_message(response).await;
                    if attempt >= self.retry.max_attempts {
                        return Err(SyncError::Transient(format!(
                            "{method} {url}: HTTP {s} (after {attempt} attempts): {message}"
                        )));
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(%url, status = s, ?delay, "server error, backing off");
                    tokio::time::sleep(delay).await;
                }
                s => {
                    let message = read_error_message(response).await;
                    return Err(SyncError::Api { status: s, message });
                }
            }
        }
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    response.json::<T>().await.map_err(|e| SyncError::Api {
        status: status.as_u16(),
        message: format!("invalid response body: {e}"),
    })
}

/// `Retry-After` in seconds; missing or malformed values fall back to a
/// conservative default.
pub(crate) fn parse_retry_after(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Pulls the human-readable message out of an API error body, falling back to
/// the raw text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

async fn read_error_message(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    extract_error_message(&body)
}
