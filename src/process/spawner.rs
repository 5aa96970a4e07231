//! Peer process spawner and exit supervision.
//!
//! Spawns the peer with all three stdio streams piped before the program
//! starts executing, so no early output is lost. Ownership of the
//! [`Child`] moves into a single watcher task immediately after spawn; that
//! task is the only place that ever calls `kill` or `wait`. Everyone else
//! holds a cheap [`ProcessHandle`] that can *request* a kill and observe
//! the exit outcome, which the watcher publishes exactly once.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::ExitStatus;

use serde::Deserialize;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

// ── Configuration ────────────────────────────────────────────────────────────

/// Program and arguments used to launch a peer.
///
/// The spawner does not interpret these; it only requires that the
/// executable can be started.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PeerCommand {
    /// Executable name or path (resolved through `PATH`).
    pub command: String,
    /// Arguments passed after the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the peer; inherited when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl PeerCommand {
    /// Command with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the peer.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Short label for log fields: the executable's file name.
    #[must_use]
    pub fn label(&self) -> String {
        std::path::Path::new(&self.command)
            .file_name()
            .map_or_else(|| self.command.clone(), |n| n.to_string_lossy().into_owned())
    }
}

// ── Endpoints ────────────────────────────────────────────────────────────────

/// The three byte-stream endpoints of a running peer.
#[derive(Debug)]
pub struct PeerEndpoints {
    /// Peer's input; this side writes requests here.
    pub stdin: ChildStdin,
    /// Peer's data output.
    pub stdout: ChildStdout,
    /// Peer's diagnostic output.
    pub stderr: ChildStderr,
}

// ── Exit outcome ─────────────────────────────────────────────────────────────

/// How the peer process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, absent when terminated by a signal or unknown.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
    /// Whether the exit followed a kill request from this side.
    pub killed: bool,
}

impl ExitOutcome {
    fn from_wait(result: std::io::Result<ExitStatus>, killed: bool) -> Self {
        match result {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                Self {
                    code,
                    reason,
                    killed,
                }
            }
            Err(err) => Self {
                code: None,
                reason: format!("wait error: {err}"),
                killed,
            },
        }
    }

    fn unknown(reason: &str) -> Self {
        Self {
            code: None,
            reason: reason.to_owned(),
            killed: false,
        }
    }

    /// Whether the process exited on its own with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.killed
    }
}

impl Display for ExitOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.killed {
            write!(f, "{} (killed)", self.reason)
        } else {
            f.write_str(&self.reason)
        }
    }
}

// ── Process handle ───────────────────────────────────────────────────────────

/// Shared handle to a supervised peer process.
///
/// Cloning is cheap; every clone observes the same exit outcome.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    label: String,
    kill_requested: CancellationToken,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    /// OS process id, if the platform reported one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Executable label used in log fields.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit outcome if the process has already ended.
    #[must_use]
    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    /// Whether the exit outcome has been published.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Request a forceful termination.
    ///
    /// Idempotent: a no-op once the process has exited or a kill is
    /// already underway.
    pub fn kill(&self) {
        if self.has_exited() {
            debug!(peer = %self.label, "kill requested after exit, ignoring");
            return;
        }
        self.kill_requested.cancel();
    }

    /// Wait until the exit outcome is available.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(published) => published.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| ExitOutcome::unknown("exit watcher stopped before publishing"))
    }
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the peer and start its exit watcher.
///
/// Must be called from within a tokio runtime. The child is created with
/// `kill_on_drop(true)`, so it cannot outlive the watcher task.
///
/// # Errors
///
/// - [`AppError::Spawn`]`("failed to spawn …")` if the executable cannot be
///   launched.
/// - [`AppError::Spawn`]`("failed to capture …")` if a pipe is missing.
pub fn spawn(command: &PeerCommand) -> Result<(PeerEndpoints, ProcessHandle)> {
    let label = command.label();

    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", command.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stderr".into()))?;

    let pid = child.id();
    info!(peer = %label, pid, args = ?command.args, "peer process spawned");

    let kill_requested = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);
    let _watcher = watch_exit(label.clone(), child, kill_requested.clone(), exit_tx);

    Ok((
        PeerEndpoints {
            stdin,
            stdout,
            stderr,
        },
        ProcessHandle {
            pid,
            label,
            kill_requested,
            exit: exit_rx,
        },
    ))
}

// ── Exit watcher ─────────────────────────────────────────────────────────────

/// Own `child` until it exits, killing it first if `kill_requested` fires,
/// then publish the outcome once through `exit_tx`.
fn watch_exit(
    label: String,
    mut child: Child,
    kill_requested: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;

            result = child.wait() => ExitOutcome::from_wait(result, false),
            () = kill_requested.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(peer = %label, %err, "failed to signal peer process");
                }
                ExitOutcome::from_wait(child.wait().await, true)
            }
        };

        if outcome.killed || outcome.success() {
            info!(peer = %label, outcome = %outcome, "peer process exited");
        } else {
            warn!(peer = %label, outcome = %outcome, "peer process exited");
        }

        exit_tx.send_replace(Some(outcome));
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
