//! Subprocess-backed log tailing.
//!
//! Each configured source runs under its own [`TailSupervisor`] task. The
//! supervisor spawns the source command, splits its stdout into lines and
//! forwards them as [`TailLine`]s. When the stream ends or the command fails
//! to start, it waits a fixed backoff and starts it again, forever, until
//! shutdown. Classification happens in the consumer, not here.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TailSourceConfig;

/// Fragments longer than this are discarded up to the next newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// One complete line from a named source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    pub source: String,
    pub line: String,
}

/// Lifecycle of one tail source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    #[default]
    Starting,
    Streaming,
    Closed,
    Restarting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TailStatus {
    pub state: WatcherState,
    pub restarts: u64,
    pub lines: u64,
}

/// Reassembles newline-delimited text from arbitrary byte chunks.
///
/// An unterminated fragment is held until its newline arrives and is never
/// emitted on its own. Trailing `\r` is stripped, blank lines are dropped
/// and invalid UTF-8 is replaced rather than rejected.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
    discarding: bool,
}

impl LineAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if std::mem::take(&mut self.discarding) {
                    self.partial.clear();
                } else {
                    self.take_line(&mut lines);
                }
            } else if !self.discarding {
                self.partial.push(byte);
                if self.partial.len() > MAX_LINE_BYTES {
                    self.partial.clear();
                    self.discarding = true;
                }
            }
        }
        lines
    }

    /// Bytes held for an unterminated line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    fn take_line(&mut self, out: &mut Vec<String>) {
        let mut bytes = std::mem::take(&mut self.partial);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let line = String::from_utf8_lossy(&bytes);
        if !line.trim().is_empty() {
            out.push(line.into_owned());
        }
    }
}

/// Handle to a running supervisor.
pub struct TailHandle {
    pub name: String,
    pub status: watch::Receiver<TailStatus>,
    pub task: JoinHandle<()>,
}

/// Keeps one tail command running and forwards its lines.
pub struct TailSupervisor {
    source: TailSourceConfig,
    backoff: Duration,
    lines_tx: mpsc::Sender<TailLine>,
    status_tx: watch::Sender<TailStatus>,
}

enum StreamEnd {
    Closed,
    Shutdown,
}

impl TailSupervisor {
    /// Spawn the supervisor task.
    pub fn spawn(
        source: TailSourceConfig,
        backoff: Duration,
        lines_tx: mpsc::Sender<TailLine>,
        shutdown: watch::Receiver<bool>,
    ) -> TailHandle {
        let (status_tx, status) = watch::channel(TailStatus::default());
        let name = source.name.clone();
        let supervisor = Self {
            source,
            backoff,
            lines_tx,
            status_tx,
        };
        let task = tokio::spawn(supervisor.run(shutdown));
        TailHandle { name, status, task }
    }

    fn set_state(&self, state: WatcherState) {
        debug!(source = %self.source.name, state = ?state, "Tail source state");
        self.status_tx.send_modify(|status| status.state = state);
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some((program, args)) = self.source.command.split_first() else {
            warn!(source = %self.source.name, "Tail source has an empty command; not starting");
            return;
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(WatcherState::Starting);

            let spawned = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            match spawned {
                Ok(child) => {
                    info!(source = %self.source.name, pid = ?child.id(), "Tail source started");
                    self.set_state(WatcherState::Streaming);
                    if let StreamEnd::Shutdown = self.stream(child, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        source = %self.source.name,
                        program = %program,
                        error = %e,
                        "Failed to spawn tail source"
                    );
                }
            }

            self.set_state(WatcherState::Closed);
            if *shutdown.borrow() {
                break;
            }

            self.set_state(WatcherState::Restarting);
            self.status_tx.send_modify(|status| status.restarts += 1);
            debug!(
                source = %self.source.name,
                backoff = ?self.backoff,
                "Restarting tail source after backoff"
            );
            tokio::select! {
                () = tokio::time::sleep(self.backoff) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(WatcherState::Closed);
        debug!(source = %self.source.name, "Tail supervisor stopped");
    }

    async fn stream(&self, mut child: Child, shutdown: &mut watch::Receiver<bool>) -> StreamEnd {
        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return StreamEnd::Closed;
        };
        let mut assembler = LineAssembler::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(
                                source = %self.source.name,
                                error = %e,
                                "Tail source read failed"
                            );
                            break;
                        }
                    };
                    for line in assembler.push(&buf[..n]) {
                        if !self.forward(line).await {
                            let _ = child.start_kill();
                            return StreamEnd::Shutdown;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    // Signalled, not awaited.
                    let _ = child.start_kill();
                    return StreamEnd::Shutdown;
                }
            }
        }

        let _ = child.start_kill();
        info!(
            source = %self.source.name,
            dropped_bytes = assembler.pending(),
            "Tail source stream ended"
        );
        StreamEnd::Closed
    }

    /// False once the consumer is gone.
    async fn forward(&self, line: String) -> bool {
        let sent = self
            .lines_tx
            .send(TailLine {
                source: self.source.name.clone(),
                line,
            })
            .await
            .is_ok();
        if sent {
            self.status_tx.send_modify(|status| status.lines += 1);
        }
        sent
    }
}
