//! Pipeline orchestration.
//!
//! [`PipelineRuntime::run`] owns the [`PipelineState`] and drives it from a
//! single task:
//!
//! ```text
//!   poll tick ──► MetricsSource::fetch ──► on_poll ──┐
//!   tail lines ◄── TailSupervisor (one per source)  ├──► PipelineState ──► watch<DashboardSnapshot>
//!   save tick ──► StateFile::save_async ◄───────────┘
//!   shutdown  ──► stop tailers ──► final flush (bounded)
//! ```
//!
//! Handlers run one at a time, so the stores need no locking. A failure in
//! any handler is logged and the loop carries on with the next event.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, PersistError, Result};
use crate::persist::StateFile;
use crate::query::DashboardSnapshot;
use crate::source::MetricsSource;
use crate::state::{PipelineState, now_ms};
use crate::tailer::{TailHandle, TailSupervisor};

/// Bound on lines buffered between tailers and the state task.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// What happened during a run, returned after a clean shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub lines: u64,
    pub deferrals: u64,
    pub saves_ok: u64,
    pub saves_failed: u64,
}

pub struct PipelineRuntime {
    config: Config,
    source: Arc<dyn MetricsSource>,
    state_file: StateFile,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
}

impl PipelineRuntime {
    /// Create a runtime and the receiver its snapshots are published on.
    pub fn new(
        config: Config,
        source: Arc<dyn MetricsSource>,
    ) -> (Self, watch::Receiver<DashboardSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(DashboardSnapshot::default());
        let state_file = StateFile::new(config.persistence.state_file.clone());
        let runtime = Self {
            config,
            source,
            state_file,
            snapshot_tx,
        };
        (runtime, snapshot_rx)
    }

    /// Restore state, then run until `shutdown` resolves.
    ///
    /// Returns an error only when the final state flush fails or times out.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let mut state = match self.state_file.load() {
            Some(persisted) => PipelineState::restore(&self.config, persisted, now_ms()),
            None => PipelineState::new(&self.config),
        };
        let mut summary = RunSummary::default();
        self.publish(&state);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (lines_tx, mut lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let tailers: Vec<TailHandle> = self
            .config
            .tail
            .sources
            .iter()
            .map(|source| {
                TailSupervisor::spawn(
                    source.clone(),
                    self.config.tail.restart_backoff(),
                    lines_tx.clone(),
                    stop_rx.clone(),
                )
            })
            .collect();
        drop(lines_tx);

        info!(
            source = %self.source.describe(),
            tail_sources = tailers.len(),
            state_file = %self.state_file.path().display(),
            "Pipeline started"
        );

        let mut poll = tokio::time::interval(self.config.metrics.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let save_every = self.config.persistence.save_interval();
        let mut save = tokio::time::interval_at(Instant::now() + save_every, save_every);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = poll.tick() => {
                    self.poll_once(&mut state, &mut summary).await;
                    self.publish(&state);
                }
                _ = save.tick() => {
                    let now = now_ms();
                    state.prune(now);
                    match self.state_file.save_async(state.to_persisted(now)).await {
                        Ok(()) => summary.saves_ok += 1,
                        Err(e) => {
                            summary.saves_failed += 1;
                            warn!(error = %e, "Periodic state save failed");
                        }
                    }
                    self.publish(&state);
                }
                Some(line) = lines_rx.recv() => {
                    summary.lines += 1;
                    if state.on_line(now_ms(), &line).deferral.is_some() {
                        summary.deferrals += 1;
                    }
                }
            }
        }

        // Tailers kill their children on this signal; they are not awaited.
        let _ = stop_tx.send(true);
        drop(tailers);

        self.final_flush(&state).await?;
        summary.saves_ok += 1;
        info!(
            polls_ok = summary.polls_ok,
            polls_failed = summary.polls_failed,
            lines = summary.lines,
            deferrals = summary.deferrals,
            "Pipeline stopped"
        );
        Ok(summary)
    }

    async fn poll_once(&self, state: &mut PipelineState, summary: &mut RunSummary) {
        match self.source.fetch().await {
            Ok(doc) => {
                let counters = state.on_poll(now_ms(), &doc);
                summary.polls_ok += 1;
                debug!(
                    delivered = counters.delivered,
                    deferred = counters.deferred,
                    queue_depth = counters.queue_depth,
                    "Poll ok"
                );
            }
            Err(e) => {
                state.on_poll_failed();
                summary.polls_failed += 1;
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "Metrics poll failed; skipping tick"
                );
            }
        }
    }

    async fn final_flush(&self, state: &PipelineState) -> Result<()> {
        let timeout = self.config.persistence.shutdown_timeout();
        let snapshot = state.to_persisted(now_ms());
        match tokio::time::timeout(timeout, self.state_file.save_async(snapshot)).await {
            Ok(Ok(())) => {
                info!(path = %self.state_file.path().display(), "Final state flushed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Final state flush failed");
                Err(Error::Persist(e))
            }
            Err(_) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                error!(timeout_ms = ms, "Final state flush timed out");
                Err(Error::Persist(PersistError::FlushTimeout(ms)))
            }
        }
    }

    fn publish(&self, state: &PipelineState) {
        self.snapshot_tx
            .send_replace(DashboardSnapshot::build(state, now_ms()));
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Runtime(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}
