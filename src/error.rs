//! Error types for the sync pipeline.

/// Top-level error type for the reconciliation system.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Transient remote failure (5xx, timeout, connection reset) after the
    /// retry budget was exhausted.
    #[error("transient error: {0}")]
    Transient(String),

    /// Authentication failure (credential refresh failed, or the remote
    /// still rejected the refreshed credentials).
    #[error("auth error: {0}")]
    Auth(String),

    /// Remote API rejected the request with a non-retryable status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A uniqueness constraint refused a duplicate insert.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// State store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a later cycle could plausibly succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Auth failures abort the whole cycle instead of a single task.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Duplicate-insert signal from the store layer.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SyncError::AlreadyExists(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SyncError>;
