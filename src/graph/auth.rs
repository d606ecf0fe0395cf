//! Bearer-token seam for the resilient client.
//!
//! Credential acquisition lives outside this crate; the client only needs a
//! current token and a refresh hook to invoke after an unauthorized response.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Environment variable consulted when no token file is configured.
pub const TOKEN_ENV_VAR: &str = "TASKMIRROR_TOKEN";

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token.
    async fn token(&self) -> Result<String>;

    /// Called after the remote rejects the current token. Returns the
    /// replacement token; failure here is an auth failure for the request.
    async fn refresh(&self) -> Result<String>;
}

/// Reads the bearer token from a file that an external helper keeps fresh.
/// `refresh()` re-reads the file, which picks up a rotated token.
pub struct FileTokens {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl std::fmt::Debug for FileTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokens").field("path", &self.path).finish()
    }
}

impl FileTokens {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    async fn read_token(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::Auth(format!("cannot read token file {}: {e}", self.path.display()))
        })?;
        let token = raw.trim().to_owned();
        if token.is_empty() {
            return Err(SyncError::Auth(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for FileTokens {
    async fn token(&self) -> Result<String> {
        if let Some(token) = self.cached.read().await.clone() {
            return Ok(token);
        }
        let token = self.read_token().await?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String> {
        let token = self.read_token().await?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }
}

/// Fixed token, typically injected via [`TOKEN_ENV_VAR`]. A fixed token that
/// got rejected once will never be accepted, so `refresh()` fails outright.
pub struct StaticTokens {
    token: String,
}

impl std::fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokens").finish_non_exhaustive()
    }
}

impl StaticTokens {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Builds a provider from [`TOKEN_ENV_VAR`], if set and non-empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String> {
        Err(SyncError::Auth(
            "static token rejected and cannot be refreshed".to_owned(),
        ))
    }
}
