//! External agent process execution.
//!
//! - `launcher`: [`ProcessLauncher`](launcher::ProcessLauncher) spawns the
//!   agent binary, enforces timeouts, and captures or streams its output.
//! - `codec`: line framing for agent stdout with a per-line size cap.
//! - `timeout`: pluggable mapping from a request's token budget to a
//!   wall-clock timeout.

pub mod codec;
pub mod launcher;
pub mod timeout;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

/// Callback invoked once per stdout line during a streaming execution.
pub type LineCallback = Box<dyn FnMut(String) + Send + 'static>;

// ── Request / result ─────────────────────────────────────────────────────────

/// A single invocation of the agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    args: Vec<String>,
    working_dir: PathBuf,
    input: Option<Bytes>,
    timeout: Duration,
}

impl ExecutionRequest {
    /// Create a request with no stdin input.
    #[must_use]
    pub fn new(args: Vec<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            args,
            working_dir: working_dir.into(),
            input: None,
            timeout,
        }
    }

    /// Attach a payload to be written to the process's stdin.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Argument vector, excluding the binary itself.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Directory the process starts in.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Stdin payload, if any.
    #[must_use]
    pub fn input(&self) -> Option<&Bytes> {
        self.input.as_ref()
    }

    /// Wall-clock budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Outcome of a process that ran to completion.
///
/// A non-zero exit code is still a successful execution at this layer;
/// callers decide what it means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code; `128 + signal` when terminated by a signal on unix.
    pub exit_code: i32,
    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
}

impl ExecutionResult {
    /// Whether the process exited with code 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// ── Executor seam ────────────────────────────────────────────────────────────

/// Anything that can run an [`ExecutionRequest`].
///
/// Implemented by [`ProcessLauncher`](launcher::ProcessLauncher) and by
/// decorators such as [`ResilientExecutor`](crate::retry::ResilientExecutor).
pub trait Executor: Send + Sync {
    /// Run to completion and capture all output, killing the process tree
    /// when `cancel` fires.
    ///
    /// Dropping the returned future also kills the process tree.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`] on spawn failure, [`AppError::Timeout`]
    /// when the time budget is exceeded, [`AppError::Cancelled`] when
    /// `cancel` fires, or [`AppError::Io`] on pipe failures.
    fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + '_>>;

    /// Run to completion and capture all output.
    ///
    /// # Errors
    ///
    /// Same as [`execute_with_cancel`](Self::execute_with_cancel).
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + '_>> {
        self.execute_with_cancel(request, CancellationToken::new())
    }

    /// Run on a background task, forwarding each stdout line to `on_line`.
    ///
    /// The handle resolves with the exit code once the process ends.
    fn execute_streaming(
        &self,
        request: ExecutionRequest,
        on_line: LineCallback,
    ) -> ExecutionHandle<i32>;
}

// ── Execution handle ─────────────────────────────────────────────────────────

/// Awaitable handle to an execution running on its own task.
///
/// Cancelling the handle, or dropping it before completion, fires the
/// execution's cancellation token and the process is killed.
#[derive(Debug)]
pub struct ExecutionHandle<T> {
    join: JoinHandle<Result<T>>,
    cancel: CancellationToken,
}

impl<T> ExecutionHandle<T> {
    /// Wrap a spawned task and the token that cancels it.
    #[must_use]
    pub fn new(join: JoinHandle<Result<T>>, cancel: CancellationToken) -> Self {
        Self { join, cancel }
    }

    /// Terminate the underlying process; the handle then resolves to
    /// [`AppError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<T> Future for ExecutionHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                Err(AppError::Cancelled("execution task aborted".into()))
            }
            Err(err) => Err(AppError::Io(format!("execution task panicked: {err}"))),
        })
    }
}

impl<T> Drop for ExecutionHandle<T> {
    fn drop(&mut self) {
        if !self.join.is_finished() {
            self.cancel.cancel();
        }
    }
}
