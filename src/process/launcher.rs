//! Agent process launcher.
//!
//! Spawns the agent binary with:
//! - `kill_on_drop(true)` plus a process-group guard, so an abandoned
//!   execution never leaks the agent or anything it started.
//! - `env_clear()` plus an allowlist, so only explicitly configured
//!   variables reach the child.
//! - Its own process group on unix, so a timeout can kill the whole tree
//!   the agent may have started.
//!
//! Every execution races process exit against its timeout and an explicit
//! [`CancellationToken`]; whichever fires first decides the outcome.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::{OutputLine, OutputLineCodec, MAX_LINE_BYTES};
use super::{ExecutionHandle, ExecutionRequest, ExecutionResult, Executor, LineCallback};
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Everything else is stripped via `env_clear()`; additional variables must
/// be supplied through [`ProcessLauncher::with_env`].
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Launcher ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct LauncherInner {
    binary: PathBuf,
    env: HashMap<String, String>,
}

/// Launches the agent binary. Cheap to clone; clones share configuration.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    inner: Arc<LauncherInner>,
}

enum Outcome<T> {
    Exited(Result<T>),
    TimedOut,
    Cancelled,
}

impl ProcessLauncher {
    /// Create a launcher for `binary`, resolved through `PATH` when relative.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                binary: binary.into(),
                env: HashMap::new(),
            }),
        }
    }

    /// Create a launcher that injects `env` into every child.
    #[must_use]
    pub fn with_env(binary: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                binary: binary.into(),
                env,
            }),
        }
    }

    /// Binary this launcher starts.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.inner.binary
    }

    /// Run `request` to completion, capturing stdout and stderr in memory.
    ///
    /// Stdin input, when present, is written concurrently with output
    /// draining and then closed.
    async fn run_captured(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut child = self.spawn(request)?;
        let mut group = GroupGuard::new(&child);
        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture agent stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Io("failed to capture agent stderr".into()))?;
        let input = request.input().cloned();

        let outcome = {
            let io = async {
                let mut out = Vec::new();
                let mut err = Vec::new();
                let (written, read_out, read_err) = tokio::join!(
                    write_input(stdin, input),
                    stdout.read_to_end(&mut out),
                    stderr.read_to_end(&mut err),
                );
                written?;
                read_out?;
                read_err?;
                let status = child.wait().await?;
                Ok::<_, AppError>((status, out, err))
            };
            race(io, request, cancel).await
        };

        let (status, out, err) = settle(outcome, &mut child, &mut group, self, request).await?;
        let exit_code = exit_code(status);
        debug!(exit_code, stdout_bytes = out.len(), "agent process exited");
        Ok(ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    }

    /// Run `request` on its own task; the returned handle resolves with the
    /// captured result.
    ///
    /// Cancelling or dropping the handle kills the process.
    #[must_use]
    pub fn execute_async(&self, request: ExecutionRequest) -> ExecutionHandle<ExecutionResult> {
        let launcher = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(
            async move { launcher.run_captured(&request, &token).await }
                .instrument(info_span!("agent_execute")),
        );
        ExecutionHandle::new(join, cancel)
    }

    /// Run `request`, invoking `on_line` for every stdout line in arrival
    /// order, and return the exit code.
    ///
    /// Lines longer than [`MAX_LINE_BYTES`] are dropped with a warning.
    /// Lines that are not valid UTF-8 are passed on lossily decoded.
    /// Stderr is drained and logged at `DEBUG`.
    async fn run_streaming(
        &self,
        request: &ExecutionRequest,
        mut on_line: LineCallback,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let mut child = self.spawn(request)?;
        let mut group = GroupGuard::new(&child);
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Io("failed to capture agent stderr".into()))?;
        let input = request.input().cloned();

        let outcome = {
            let io = async {
                // Owned by the pump: stopping early closes the pipe.
                let pump = async {
                    let mut lines = FramedRead::new(stdout, OutputLineCodec::new());
                    let mut delivered = 0_u64;
                    while let Some(item) = lines.next().await {
                        match item? {
                            OutputLine::Line(line) => {
                                delivered += 1;
                                on_line(line);
                            }
                            OutputLine::Oversized => {
                                warn!(
                                    limit = MAX_LINE_BYTES,
                                    "agent output line too long, skipping"
                                );
                            }
                        }
                    }
                    Ok::<u64, AppError>(delivered)
                };
                let (written, pumped, stderr_text) =
                    tokio::join!(write_input(stdin, input), pump, drain(stderr));
                written?;
                let delivered = pumped?;
                if !stderr_text.trim().is_empty() {
                    debug!(stderr = stderr_text.trim_end(), "agent stderr");
                }
                let status = child.wait().await?;
                debug!(lines = delivered, "agent stream ended");
                Ok::<ExitStatus, AppError>(status)
            };
            race(io, request, cancel).await
        };

        let status = settle(outcome, &mut child, &mut group, self, request).await?;
        Ok(exit_code(status))
    }

    fn spawn(&self, request: &ExecutionRequest) -> Result<Child> {
        let mut cmd = Command::new(&self.inner.binary);
        cmd.args(request.args());

        // Strip inherited environment, then inject only the safe allowlist.
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&self.inner.env);

        let stdin = if request.input().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        cmd.current_dir(request.working_dir())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|err| {
            warn!(binary = %self.inner.binary.display(), %err, "agent spawn failed");
            AppError::launch(&err)
        })?;

        info!(
            binary = %self.inner.binary.display(),
            pid = child.id(),
            args = request.args().len(),
            "agent process spawned"
        );
        Ok(child)
    }

    async fn timed_out(&self, child: &mut Child, request: &ExecutionRequest) -> AppError {
        warn!(
            binary = %self.inner.binary.display(),
            timeout = ?request.timeout(),
            "agent exceeded its time budget, killing process tree"
        );
        kill_tree(child).await;
        AppError::Timeout(format!(
            "agent did not finish within {:?}",
            request.timeout()
        ))
    }
}

impl Executor for ProcessLauncher {
    fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + '_>> {
        Box::pin(async move { self.run_captured(&request, &cancel).await })
    }

    fn execute_streaming(
        &self,
        request: ExecutionRequest,
        on_line: LineCallback,
    ) -> ExecutionHandle<i32> {
        let launcher = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(
            async move {
                launcher.run_streaming(&request, on_line, &token).await
            }
            .instrument(info_span!("agent_stream")),
        );
        ExecutionHandle::new(join, cancel)
    }
}

// ── Private helpers ──────────────────────────────────────────────────────────

async fn race<T>(
    io: impl Future<Output = Result<T>>,
    request: &ExecutionRequest,
    cancel: &CancellationToken,
) -> Outcome<T> {
    tokio::select! {
        result = io => Outcome::Exited(result),
        () = tokio::time::sleep(request.timeout()) => Outcome::TimedOut,
        () = cancel.cancelled() => Outcome::Cancelled,
    }
}

/// Turn a raced outcome into the caller's result, killing the process tree
/// on every path where the child may still be running.
async fn settle<T>(
    outcome: Outcome<T>,
    child: &mut Child,
    group: &mut GroupGuard,
    launcher: &ProcessLauncher,
    request: &ExecutionRequest,
) -> Result<T> {
    let result = match outcome {
        Outcome::Exited(Ok(value)) => Ok(value),
        Outcome::Exited(Err(err)) => {
            warn!(%err, "agent i/o failed, killing process tree");
            kill_tree(child).await;
            Err(err)
        }
        Outcome::TimedOut => Err(launcher.timed_out(child, request).await),
        Outcome::Cancelled => Err(cancelled(child).await),
    };
    group.disarm();
    result
}

async fn cancelled(child: &mut Child) -> AppError {
    info!(pid = child.id(), "execution cancelled, killing process tree");
    kill_tree(child).await;
    AppError::Cancelled("execution cancelled by caller".into())
}

/// Write `input` to the child's stdin and close it.
///
/// A broken pipe means the child exited without reading its input; that is
/// the child's business and is not treated as a launcher failure.
async fn write_input(stdin: Option<ChildStdin>, input: Option<Bytes>) -> Result<()> {
    let (Some(mut stdin), Some(input)) = (stdin, input) else {
        return Ok(());
    };

    let written = match stdin.write_all(&input).await {
        Ok(()) => stdin.shutdown().await,
        Err(err) => Err(err),
    };

    match written {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("agent closed stdin before consuming all input");
            Ok(())
        }
        Err(err) => Err(AppError::Io(format!("failed to write agent stdin: {err}"))),
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf).await {
        debug!(%err, "failed to drain agent stderr");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Force-kill the child and, on unix, every process in its group.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid, %err, "failed to kill agent process group"),
        }
    }

    if let Err(err) = child.kill().await {
        debug!(%err, "agent process already gone");
    }
}

/// Kills the child's process group when dropped while still armed.
///
/// `kill_on_drop` only reaches the direct child; this covers everything it
/// spawned when an execution future is dropped mid-flight.
#[derive(Debug)]
struct GroupGuard {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            debug!(pgid, "execution dropped, killing process group");
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
