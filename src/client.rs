//! Agent client: admission, execution, and parsing composed into a single
//! request/response call.
//!
//! ```text
//! ask / stream ──► AdmissionLimiter ──► Executor ──► StreamParser ──► AgentResponse
//! ```
//!
//! The prompt is written to the agent's stdin; its stdout is parsed as a
//! stream of JSON records. The admission permit is held for the whole
//! execution and released when the call returns or is dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::limiter::AdmissionLimiter;
use crate::process::launcher::ProcessLauncher;
use crate::process::timeout::TimeoutPolicy;
use crate::process::{ExecutionRequest, ExecutionResult, Executor};
use crate::retry::ResilientExecutor;
use crate::stream::{AgentResponse, StreamEvent, StreamParser};
use crate::Result;

/// Key used when a caller does not name an admission pool.
pub const DEFAULT_KEY: &str = "default";

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 512;

/// One prompt for the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Prompt text, written to the agent's stdin.
    pub prompt: String,
    /// Token budget; feeds the timeout policy.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Explicit timeout overriding the policy.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl AgentRequest {
    /// A request with only a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Client for the configured agent binary.
#[derive(Debug)]
pub struct AgentClient<E> {
    executor: E,
    limiter: Arc<AdmissionLimiter>,
    timeout_policy: Box<dyn TimeoutPolicy>,
    args: Vec<String>,
    working_dir: PathBuf,
}

/// The production client: process launcher wrapped in retries.
pub type DefaultAgentClient = AgentClient<ResilientExecutor<ProcessLauncher>>;

impl DefaultAgentClient {
    /// Build the full stack from configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        let launcher =
            ProcessLauncher::with_env(config.agent.binary.clone(), config.agent.env.clone());
        let executor = ResilientExecutor::new(launcher, config.retry.policy());
        Self::new(
            executor,
            Arc::new(AdmissionLimiter::from_config(&config.concurrency)),
            config.timeout_policy(),
            config.agent.args.clone(),
            config.agent.working_dir.clone(),
        )
    }
}

impl<E: Executor> AgentClient<E> {
    /// Assemble a client from its parts.
    #[must_use]
    pub fn new(
        executor: E,
        limiter: Arc<AdmissionLimiter>,
        timeout_policy: Box<dyn TimeoutPolicy>,
        args: Vec<String>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            limiter,
            timeout_policy,
            args,
            working_dir,
        }
    }

    /// The wrapped executor.
    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The limiter shared by every call on this client.
    #[must_use]
    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    /// Timeout applied to `request`.
    #[must_use]
    pub fn timeout_for(&self, request: &AgentRequest) -> Duration {
        request.timeout_seconds.map_or_else(
            || self.timeout_policy.timeout_for(request.max_tokens),
            Duration::from_secs,
        )
    }

    /// Run `request` to completion and return the parsed response.
    ///
    /// A response whose stream ended without a completion (including a
    /// non-zero exit) is returned with a failed outcome, not as an error.
    ///
    /// # Errors
    ///
    /// Returns the executor's error on launch failure, timeout, or I/O
    /// failure, and [`AppError::Shutdown`](crate::AppError::Shutdown) if the
    /// limiter is closed.
    pub async fn ask(&self, key: &str, request: &AgentRequest) -> Result<AgentResponse> {
        let span = info_span!("agent_ask", key);
        async move {
            let permit = self.limiter.acquire(key, None).await?;
            let result = self.executor.execute(self.execution_request(request)).await?;
            self.limiter.release(permit);

            let mut parser = StreamParser::new();
            for line in result.stdout.lines() {
                parser.feed(line);
            }
            finish(&mut parser, &result);

            let response = parser.into_response();
            info!(
                exit_code = result.exit_code,
                complete = response.is_complete(),
                tokens = response.usage.total_tokens(),
                "agent call finished"
            );
            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Run `request` and deliver each [`StreamEvent`] to `on_event` as it is
    /// decoded, in order. The final event is always terminal.
    ///
    /// # Errors
    ///
    /// Same as [`ask`](Self::ask). On an error `on_event` has already seen
    /// a terminal [`StreamEvent::Error`] describing it.
    pub async fn stream<F>(
        &self,
        key: &str,
        request: &AgentRequest,
        mut on_event: F,
    ) -> Result<AgentResponse>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let span = info_span!("agent_stream", key);
        async move {
            let permit = self.limiter.acquire(key, None).await?;

            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
            let handle = self.executor.execute_streaming(
                self.execution_request(request),
                Box::new(move |line| {
                    // Receiver gone means the caller stopped listening.
                    let _ = line_tx.send(line);
                }),
            );

            let mut parser = StreamParser::new();
            while let Some(line) = line_rx.recv().await {
                if let Some(event) = parser.feed(&line) {
                    on_event(event);
                }
            }

            let exit = handle.await;
            self.limiter.release(permit);

            match exit {
                Ok(exit_code) => {
                    let synthetic = if exit_code == 0 || parser.is_closed() {
                        parser.close()
                    } else {
                        parser.abort(format!("agent exited with code {exit_code}"))
                    };
                    if let Some(event) = synthetic {
                        on_event(event);
                    }
                    let response = parser.into_response();
                    info!(exit_code, complete = response.is_complete(), "agent stream finished");
                    Ok(response)
                }
                Err(err) => {
                    warn!(%err, "agent stream aborted");
                    if let Some(event) = parser.abort(err.to_string()) {
                        on_event(event);
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn execution_request(&self, request: &AgentRequest) -> ExecutionRequest {
        let timeout = self.timeout_for(request);
        debug!(?timeout, max_tokens = request.max_tokens, "building execution request");
        ExecutionRequest::new(self.args.clone(), self.working_dir.clone(), timeout)
            .with_input(request.prompt.clone().into_bytes())
    }
}

/// Close the parser, attributing a missing terminal record to a failed exit.
fn finish(parser: &mut StreamParser, result: &ExecutionResult) {
    if result.is_success() || parser.is_closed() {
        parser.close();
    } else {
        parser.abort(exit_failure(result));
    }
}

fn exit_failure(result: &ExecutionResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        return format!("agent exited with code {}", result.exit_code);
    }
    let mut start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    format!("agent exited with code {}: {}", result.exit_code, &stderr[start..])
}
