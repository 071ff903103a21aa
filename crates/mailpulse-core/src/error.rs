//! Error types for mailpulse-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mailpulse-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Metrics endpoint errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// State file errors
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, task joins, signal setup)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Fetch(err) => Some(err.remediation()),
            Self::Persist(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Check config", "mailpulse check-config")
                    .alternative("Verify the state directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the pipeline.")
                    .command("Run", "mailpulse run")
                    .alternative("If the issue persists, run with RUST_LOG=debug."),
            ),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Omit --config to run with built-in defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("Validate", "mailpulse check-config --config mailpulse.toml"),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Validate", "mailpulse check-config")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Validate", "mailpulse check-config --config mailpulse.toml")
                    .alternative("Intervals, caps and retention windows must be non-zero.")
            }
        }
    }
}

/// Metrics endpoint errors. All of them mean "skip this tick".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("metrics request failed: {0}")]
    Transport(String),

    #[error("metrics request timed out after {0} ms")]
    Timeout(u64),

    #[error("metrics endpoint returned HTTP {0}")]
    Status(u16),

    #[error("metrics body is not valid JSON: {0}")]
    InvalidBody(String),
}

impl FetchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Transport(_) | Self::Timeout(_) => {
                Remediation::new(
                    "The MTA metrics endpoint is unreachable. Check that the MTA is up.",
                )
                .command("Probe endpoint", "curl -sf http://127.0.0.1:8000/metrics.json")
                .alternative("Raise [metrics].fetch_timeout_ms if the MTA is slow to answer.")
            }
            Self::Status(code) => Remediation::new(format!(
                "The metrics endpoint answered HTTP {code}. Verify [metrics].endpoint."
            ))
            .command("Show config", "mailpulse check-config"),
            Self::InvalidBody(_) => {
                Remediation::new("The metrics endpoint did not return JSON. Verify the URL path.")
                    .command("Show config", "mailpulse check-config")
            }
        }
    }
}

/// State file errors
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to write state file {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("failed to encode state: {0}")]
    EncodeFailed(String),

    #[error("state flush abandoned after {0} ms")]
    FlushTimeout(u64),
}

impl PersistError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::WriteFailed { path, .. } => Remediation::new(format!(
                "Could not write {path}. Check that the directory is writable."
            ))
            .command("Check directory", format!("ls -ld \"$(dirname {path})\""))
            .alternative("Point [persistence].state_file at a writable location."),
            Self::EncodeFailed(_) => Remediation::new("State encoding failed; this is a bug.")
                .command("Inspect state", "mailpulse inspect-state"),
            Self::FlushTimeout(ms) => Remediation::new(format!(
                "The shutdown flush did not finish within {ms} ms."
            ))
            .command("Inspect state", "mailpulse inspect-state")
            .alternative("Raise [persistence].shutdown_timeout_ms on slow disks."),
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
