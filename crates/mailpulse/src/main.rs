//! mailpulse CLI
//!
//! `mailpulse run` drives the pipeline until SIGINT/SIGTERM. The other
//! subcommands are offline helpers over the same configuration, state file
//! and classifier.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mailpulse_core::classify;
use mailpulse_core::config::{Config, LogFormat};
use mailpulse_core::error::{Error, format_error_with_remediation};
use mailpulse_core::logging::{LogConfig, init_logging};
use mailpulse_core::persist::StateFile;
use mailpulse_core::query::DashboardSnapshot;
use mailpulse_core::runtime::{PipelineRuntime, wait_for_shutdown_signal};
use mailpulse_core::source::HttpMetricsSource;
use mailpulse_core::state::{PipelineState, now_ms};

#[derive(Parser)]
#[command(
    name = "mailpulse",
    author,
    version,
    about = "Telemetry pipeline for a mail transfer agent"
)]
struct Cli {
    /// Path to mailpulse.toml (built-in defaults when omitted)
    #[arg(long, short, global = true, env = "MAILPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true, env = "MAILPULSE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll metrics, tail logs and persist state until interrupted
    Run,
    /// Validate the configuration and print it as TOML
    CheckConfig,
    /// Summarize a persisted state file
    InspectState {
        /// State file (defaults to the configured one)
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Classify log lines from stdin, one JSON result per line
    Classify {
        /// Display truncation length (defaults to events.max_line_len)
        #[arg(long)]
        max_len: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).map_err(Error::from)?;

    let mut log_config = LogConfig::from(&config.general);
    if !matches!(cli.command, Command::Run) {
        log_config.level = "warn".to_string();
    }
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config).context("failed to initialize logging")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::CheckConfig => check_config(&config, cli.config.as_deref()),
        Command::InspectState { state, format } => inspect_state(&config, state, format),
        Command::Classify { max_len } => {
            classify_stdin(max_len.unwrap_or(config.events.max_line_len))
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let source = HttpMetricsSource::new(&config.metrics)?;
    let (runtime, _snapshots) = PipelineRuntime::new(config, Arc::new(source));
    let summary = runtime
        .run(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!(error = %e, "Signal handler failed; stopping");
            }
        })
        .await?;
    tracing::info!(
        saves_ok = summary.saves_ok,
        saves_failed = summary.saves_failed,
        "Exiting"
    );
    Ok(())
}

fn check_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let origin = path.map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());
    let rendered = config.to_toml().map_err(Error::from)?;
    println!("# config ok ({origin})");
    print!("{rendered}");
    Ok(())
}

fn inspect_state(config: &Config, state: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let path = state.unwrap_or_else(|| config.persistence.state_file.clone());
    let file = StateFile::new(&path);
    let persisted = file
        .load()
        .with_context(|| format!("no readable state at {}", path.display()))?;

    let saved_at = persisted.saved_at;
    let raw_samples = persisted.samples.len();
    let raw_deferrals = persisted.deferrals.len();
    let now = now_ms();
    let restored = PipelineState::restore(config, persisted, now);
    let snapshot = DashboardSnapshot::build(&restored, now);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Plain => {
            let saved = chrono::DateTime::from_timestamp_millis(saved_at)
                .map_or_else(|| "unknown".to_string(), |dt| dt.to_rfc3339());
            println!("state file:  {}", path.display());
            println!("saved at:    {saved}");
            println!(
                "samples:     {} retained of {raw_samples}",
                snapshot.counts.samples
            );
            println!(
                "deferrals:   {} retained of {raw_deferrals}",
                snapshot.counts.deferrals
            );
            println!(
                "peak minute: delivered={} deferred={} bounced={}",
                snapshot.peaks.minute.delivered,
                snapshot.peaks.minute.deferred,
                snapshot.peaks.minute.bounced
            );
            println!(
                "peak hour:   delivered={} deferred={} bounced={}",
                snapshot.peaks.hour.delivered,
                snapshot.peaks.hour.deferred,
                snapshot.peaks.hour.bounced
            );
            for entry in &snapshot.top_domains {
                println!("  {:>6}  {}", entry.count, entry.name);
            }
        }
    }
    Ok(())
}

fn classify_stdin(max_len: usize) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let classification = classify::classify_line(&line, max_len);
        serde_json::to_writer(&mut stdout, &classification)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;
    Ok(())
}
