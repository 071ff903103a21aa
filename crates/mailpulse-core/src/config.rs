//! Configuration management for mailpulse
//!
//! Handles loading and validation of mailpulse.toml configuration files.
//! Every field carries a serde default, so an empty file is a valid config.
//! Configuration is read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogLevel;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Metrics endpoint polling and sample retention
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Deferral event retention
    #[serde(default)]
    pub deferrals: DeferralConfig,

    /// Per-domain last-error retention
    #[serde(default)]
    pub errors: ErrorLedgerConfig,

    /// Recent event display buffer
    #[serde(default)]
    pub events: EventsConfig,

    /// Log tail sources
    #[serde(default)]
    pub tail: TailConfig,

    /// State file settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, written in addition to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// URL of the cumulative-counter JSON document
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// How long samples and queue snapshots are kept
    #[serde(default = "default_sample_retention_secs")]
    pub retention_secs: u64,

    /// Points returned in the rate series
    #[serde(default = "default_series_points")]
    pub rate_points: usize,

    /// Points returned in the queue-depth series
    #[serde(default = "default_series_points")]
    pub queue_points: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retention_secs: default_sample_retention_secs(),
            rate_points: default_series_points(),
            queue_points: default_series_points(),
        }
    }
}

impl MetricsConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8000/metrics.json".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_fetch_timeout_ms() -> u64 {
    2500
}

fn default_sample_retention_secs() -> u64 {
    2 * 60 * 60
}

fn default_series_points() -> usize {
    120
}

/// Deferral event configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferralConfig {
    /// How long deferral events are kept
    #[serde(default = "default_event_retention_secs")]
    pub retention_secs: u64,

    /// Hard cap on retained deferral events
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Entries in the top domain/provider rankings
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Trailing window the rankings count over
    #[serde(default = "default_ranking_window_secs")]
    pub ranking_window_secs: u64,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_event_retention_secs(),
            max_events: default_max_events(),
            top_n: default_top_n(),
            ranking_window_secs: default_ranking_window_secs(),
        }
    }
}

impl DeferralConfig {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    #[must_use]
    pub fn ranking_window(&self) -> Duration {
        Duration::from_secs(self.ranking_window_secs)
    }
}

fn default_event_retention_secs() -> u64 {
    48 * 60 * 60
}

fn default_max_events() -> usize {
    50_000
}

fn default_top_n() -> usize {
    10
}

fn default_ranking_window_secs() -> u64 {
    60 * 60
}

/// Last-error ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorLedgerConfig {
    /// Records kept per destination domain
    #[serde(default = "default_per_domain_cap")]
    pub per_domain_cap: usize,

    /// Age after which records are swept from every domain
    #[serde(default = "default_event_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ErrorLedgerConfig {
    fn default() -> Self {
        Self {
            per_domain_cap: default_per_domain_cap(),
            retention_secs: default_event_retention_secs(),
        }
    }
}

impl ErrorLedgerConfig {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn default_per_domain_cap() -> usize {
    20
}

/// Recent event display configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    /// Lines kept in the recent-event ring
    #[serde(default = "default_recent_cap")]
    pub recent_cap: usize,

    /// Characters kept per displayed line
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            recent_cap: default_recent_cap(),
            max_line_len: default_max_line_len(),
        }
    }
}

fn default_recent_cap() -> usize {
    200
}

fn default_max_line_len() -> usize {
    400
}

/// One follow subprocess
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TailSourceConfig {
    /// Name used in logs and recent events
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
}

/// Log tail configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TailConfig {
    /// Fixed delay before a dead source is restarted
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Follow subprocesses, supervised independently
    #[serde(default = "default_tail_sources")]
    pub sources: Vec<TailSourceConfig>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            restart_backoff_ms: default_restart_backoff_ms(),
            sources: default_tail_sources(),
        }
    }
}

impl TailConfig {
    #[must_use]
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

fn default_restart_backoff_ms() -> u64 {
    2000
}

fn default_tail_sources() -> Vec<TailSourceConfig> {
    vec![
        TailSourceConfig {
            name: "files".to_string(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "exec tail -F -n 0 /var/log/kumomta/*.log".to_string(),
            ],
        },
        TailSourceConfig {
            name: "journal".to_string(),
            command: vec![
                "journalctl".to_string(),
                "-f".to_string(),
                "-n".to_string(),
                "0".to_string(),
                "-o".to_string(),
                "json".to_string(),
                "-u".to_string(),
                "kumomta".to_string(),
            ],
        },
    ]
}

/// State file configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    /// Path of the single state document
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Periodic snapshot interval
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    /// Upper bound on the shutdown flush
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            save_interval_secs: default_save_interval_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_state_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("mailpulse")
        .join("state.json")
}

fn default_save_interval_secs() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from `path`, or built-in defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(display));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(display, e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("metrics.poll_interval_ms", self.metrics.poll_interval_ms),
            ("metrics.fetch_timeout_ms", self.metrics.fetch_timeout_ms),
            ("metrics.retention_secs", self.metrics.retention_secs),
            ("deferrals.retention_secs", self.deferrals.retention_secs),
            ("deferrals.max_events", self.deferrals.max_events as u64),
            ("errors.per_domain_cap", self.errors.per_domain_cap as u64),
            ("errors.retention_secs", self.errors.retention_secs),
            ("events.recent_cap", self.events.recent_cap as u64),
            ("events.max_line_len", self.events.max_line_len as u64),
            ("persistence.save_interval_secs", self.persistence.save_interval_secs),
            ("persistence.shutdown_timeout_ms", self.persistence.shutdown_timeout_ms),
            ("tail.restart_backoff_ms", self.tail.restart_backoff_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        if let Err(e) = self.general.log_level.parse::<LogLevel>() {
            return Err(ConfigError::ValidationError(format!("general.log_level: {e}")));
        }

        if self.metrics.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "metrics.endpoint must not be empty".to_string(),
            ));
        }

        for source in &self.tail.sources {
            if source.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "tail source '{}' has an empty command",
                    source.name
                )));
            }
        }

        Ok(())
    }
}
