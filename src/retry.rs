//! Retry-with-backoff decorator for executors.
//!
//! [`ResilientExecutor`] retries failed non-streaming executions whose error
//! the classifier deems transient. The wait before attempt `k + 1` is
//! `min(initial_delay * multiplier^(k-1), max_delay)`. When the budget runs
//! out the last error is returned unchanged.
//!
//! Streaming executions are passed straight through: lines already handed
//! to the caller cannot be taken back, so a replay would duplicate them.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::{ExecutionHandle, ExecutionRequest, ExecutionResult, Executor, LineCallback};
use crate::{AppError, Result};

/// Decides whether a failure is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&AppError) -> bool + Send + Sync>;

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Cap on any single wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt that follows failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(self.max_delay)
    }
}

/// Wraps an [`Executor`] with retry-with-backoff for `execute`.
#[derive(Clone)]
pub struct ResilientExecutor<E> {
    inner: E,
    policy: RetryPolicy,
    classifier: RetryClassifier,
}

impl<E: Debug> Debug for ResilientExecutor<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> ResilientExecutor<E> {
    /// Retry transient failures as classified by [`AppError::is_transient`].
    #[must_use]
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self::with_classifier(inner, policy, Arc::new(AppError::is_transient))
    }

    /// Retry whatever `classifier` accepts.
    #[must_use]
    pub fn with_classifier(inner: E, policy: RetryPolicy, classifier: RetryClassifier) -> Self {
        Self {
            inner,
            policy,
            classifier,
        }
    }

    /// The wrapped executor.
    #[must_use]
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// The retry policy in effect.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn execute_with_retry(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .inner
                .execute_with_cancel(request.clone(), cancel.clone())
                .await
            {
                Ok(result) => {
                    if attempt > 1 {
                        info!(attempt, "execution succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) if attempt < max_attempts && (self.classifier)(&err) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(attempt, max_attempts, ?delay, %err, "transient execution failure, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            return Err(AppError::Cancelled("execution cancelled by caller".into()));
                        }
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<E: Executor> Executor for ResilientExecutor<E> {
    fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + '_>> {
        Box::pin(self.execute_with_retry(request, cancel))
    }

    fn execute_streaming(
        &self,
        request: ExecutionRequest,
        on_line: LineCallback,
    ) -> ExecutionHandle<i32> {
        self.inner.execute_streaming(request, on_line)
    }
}

impl<E: Executor + Clone + 'static> ResilientExecutor<E> {
    /// Run [`execute`](Executor::execute) with retries on its own task.
    ///
    /// Cancelling or dropping the handle reaches the current attempt, whose
    /// process tree is killed, and stops any pending backoff.
    #[must_use]
    pub fn execute_async(&self, request: ExecutionRequest) -> ExecutionHandle<ExecutionResult> {
        let this = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { this.execute_with_retry(request, token).await });
        ExecutionHandle::new(join, cancel)
    }
}
