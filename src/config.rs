//! Configuration types for the sync daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the reconciliation daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Engine settings (monitored lists, polling cadence).
    pub engine: EngineConfig,
    /// Classifier keyword rules.
    pub rules: RulesConfig,
    /// Weekly review event settings.
    pub review: ReviewConfig,
    /// Calendar event settings.
    pub calendar: CalendarConfig,
    /// Remote API client settings.
    pub api: ApiConfig,
    /// State store backend selection.
    pub store: StoreConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display names of the to-do lists to reconcile. Lists that cannot be
    /// resolved on the remote are logged and skipped.
    pub monitored_lists: Vec<String>,
    /// Seconds to sleep between cycles in continuous mode.
    pub polling_interval_secs: u64,
    /// Display name of the notebook that receives task artifacts.
    pub notebook: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitored_lists: vec![
                "Hoy".to_owned(),
                "Esta semana".to_owned(),
                "En espera".to_owned(),
            ],
            polling_interval_secs: 300,
            notebook: "Tareas".to_owned(),
        }
    }
}

/// Classifier keyword rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Keywords that suggest a task needs a note artifact (+2 each).
    pub positive_keywords: Vec<String>,
    /// Keywords that suggest a quick errand (-2 each).
    pub negative_keywords: Vec<String>,
    /// Marker that forces artifact creation regardless of score.
    pub force_artifact_prefix: String,
    /// Marker that forces skipping regardless of score.
    pub force_skip_prefix: String,
    /// Titles with at least this many words earn +1.
    pub long_title_words: usize,
    /// Titles with fewer than this many words earn -1.
    pub short_title_words: usize,
    /// Minimum score for a needs-artifact verdict.
    pub score_threshold: i32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            positive_keywords: vec![
                "preparar".to_owned(),
                "diseñar".to_owned(),
                "investigar".to_owned(),
                "organizar".to_owned(),
                "resolver".to_owned(),
                "planear".to_owned(),
                "propuesta".to_owned(),
                "presentación".to_owned(),
                "proyecto".to_owned(),
                "analizar".to_owned(),
                "evaluar".to_owned(),
                "documentar".to_owned(),
                "estrategia".to_owned(),
            ],
            negative_keywords: vec![
                "pagar".to_owned(),
                "comprar".to_owned(),
                "llamar".to_owned(),
                "enviar".to_owned(),
                "mandar".to_owned(),
                "imprimir".to_owned(),
                "agendar".to_owned(),
                "recordar".to_owned(),
            ],
            force_artifact_prefix: "#note".to_owned(),
            force_skip_prefix: "#simple".to_owned(),
            long_title_words: 8,
            short_title_words: 4,
            score_threshold: 2,
        }
    }
}

/// Weekly review configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Whether the weekly review event is scheduled at all.
    pub enabled: bool,
    /// Weekday of the review, lowercase English name ("sunday").
    pub day: String,
    /// Local start time of the review event, "HH:MM".
    pub time: String,
    /// Event duration in minutes.
    pub duration_minutes: i64,
    /// Subject of the review event.
    pub title: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            day: "sunday".to_owned(),
            time: "18:00".to_owned(),
            duration_minutes: 30,
            title: "Weekly task review".to_owned(),
        }
    }
}

impl ReviewConfig {
    /// Parses `day` into a weekday.
    pub fn weekday(&self) -> crate::error::Result<chrono::Weekday> {
        match self.day.trim().to_lowercase().as_str() {
            "monday" => Ok(chrono::Weekday::Mon),
            "tuesday" => Ok(chrono::Weekday::Tue),
            "wednesday" => Ok(chrono::Weekday::Wed),
            "thursday" => Ok(chrono::Weekday::Thu),
            "friday" => Ok(chrono::Weekday::Fri),
            "saturday" => Ok(chrono::Weekday::Sat),
            "sunday" => Ok(chrono::Weekday::Sun),
            other => Err(crate::error::SyncError::Config(format!(
                "unknown review day: {other}"
            ))),
        }
    }

    /// Parses `time` into a naive time of day.
    pub fn start_time(&self) -> crate::error::Result<chrono::NaiveTime> {
        chrono::NaiveTime::parse_from_str(self.time.trim(), "%H:%M")
            .map_err(|e| crate::error::SyncError::Config(format!("bad review time: {e}")))
    }
}

/// Calendar event configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// IANA timezone name passed through to the calendar API.
    pub timezone: String,
    /// Hour of day (0-23) at which task events start on their due date.
    pub event_hour: u32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Mexico_City".to_owned(),
            event_hour: 9,
        }
    }
}

/// Remote API client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the remote API.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Total attempts per logical request (first try included).
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// File holding the current bearer token. An external helper keeps it
    /// fresh; `None` falls back to the `TASKMIRROR_TOKEN` environment variable.
    pub token_path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_owned(),
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            token_path: None,
        }
    }
}

/// Which state store backend to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Embedded SQLite file.
    #[default]
    Sqlite,
    /// Cloud table service (shared state across machines).
    Table,
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection.
    pub backend: StoreBackend,
    /// SQLite database path (None = platform data dir).
    pub sqlite_path: Option<PathBuf>,
    /// Table service settings (table backend only).
    pub table: TableConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: None,
            table: TableConfig::default(),
        }
    }
}

/// Cloud table service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Account endpoint, e.g. `https://acct.table.core.windows.net`.
    pub endpoint: String,
    /// SAS token query string (without the leading `?`).
    pub sas_token: String,
    /// Prefix for the three table names.
    pub table_prefix: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            sas_token: String::new(),
            table_prefix: "taskmirror".to_owned(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Whether to keep a daily-rolled log file in addition to stderr.
    pub file: bool,
    /// Log directory (None = platform data dir).
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: true, dir: None }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SyncError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks settings the daemon cannot run without.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.engine.monitored_lists.is_empty() {
            return Err(crate::error::SyncError::Config(
                "no monitored lists configured".to_owned(),
            ));
        }
        self.review.weekday()?;
        self.review.start_time()?;
        if self.calendar.event_hour > 23 {
            return Err(crate::error::SyncError::Config(format!(
                "event_hour out of range: {}",
                self.calendar.event_hour
            )));
        }
        if self.store.backend == StoreBackend::Table && self.store.table.endpoint.is_empty() {
            return Err(crate::error::SyncError::Config(
                "table backend selected but no endpoint configured".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path under the platform config dir.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("taskmirror")
            .join("config.toml")
    }

    /// Returns the default data directory (SQLite file, logs).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("taskmirror")
    }
}
