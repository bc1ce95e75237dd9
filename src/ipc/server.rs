//! Local socket session server.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Every accepted connection is one entry in
//! the [`SessionRegistry`]; connections beyond `max_sessions` receive an
//! error line and are closed.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "run", "prompt": "summarize README.md", "key": "chat", "timeout_seconds": 120}
//! {"command": "ask", "prompt": "summarize README.md"}
//! {"command": "list"}
//! {"command": "ping"}
//! ```
//!
//! `ask` goes through the message bus and returns only the final response.
//!
//! Response (one JSON object per line). A `run` streams its events first:
//! ```json
//! {"ok": true, "event": {"type": "partial_content", "text": "..."}}
//! {"ok": true, "data": {"response": { ... }}}
//! {"ok": false, "error": "capacity exceeded: session limit of 64 reached"}
//! ```

use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bus::{AgentBus, AgentJob};
use crate::client::{AgentClient, AgentRequest, DEFAULT_KEY};
use crate::process::Executor;
use crate::session::SessionRegistry;
use crate::stream::{AgentResponse, StreamEvent};
use crate::{AppError, Result};

/// Slack added to an `ask` reply deadline on top of the execution timeout.
const ASK_REPLY_GRACE: Duration = Duration::from_secs(30);

/// Outbound line queue of one connection.
pub type ConnectionSender = mpsc::UnboundedSender<String>;

/// Shared state behind every connection.
#[derive(Debug)]
pub struct IpcState<E> {
    /// Client that runs `run` commands.
    pub client: Arc<AgentClient<E>>,
    /// One entry per open connection.
    pub sessions: Arc<SessionRegistry<ConnectionSender>>,
    /// Bus carrying `ask` commands.
    pub bus: AgentBus,
}

/// Inbound request line.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Prompt text (for `run`).
    prompt: Option<String>,
    /// Admission key (for `run`).
    key: Option<String>,
    /// Explicit timeout (for `run`).
    timeout_seconds: Option<u64>,
    /// Token budget (for `run`).
    max_tokens: Option<u32>,
}

/// Outbound response line.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Streamed event of a running command.
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<StreamEvent>,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            event: None,
            data: Some(data),
            error: None,
        }
    }

    fn event(event: StreamEvent) -> Self {
        Self {
            ok: true,
            event: Some(event),
            data: None,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            event: None,
            data: None,
            error: Some(message.into()),
        }
    }

    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
        line.push('\n');
        line
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server<E: Executor + 'static>(
    name: &str,
    state: Arc<IpcState<E>>,
    ct: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener_name = name
        .to_owned()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state, ct.child_token()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

/// Serve one connection until EOF, eviction, or shutdown.
async fn handle_connection<E: Executor + 'static>(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<IpcState<E>>,
    ct: CancellationToken,
) {
    let (reader, writer) = stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let session_id = match state.sessions.register(out_tx.clone()).await {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(%err, "IPC connection rejected");
            let _ = out_tx.send(IpcResponse::error(err.to_string()).to_line());
            drop(out_tx);
            let _ = writer_task.await;
            return;
        }
    };

    let span = info_span!("ipc_conn", session_id = %session_id);
    async {
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = ct.cancelled() => break,
                read = buf_reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if !state.sessions.touch(&session_id).await {
                        let _ = out_tx.send(IpcResponse::error("session expired").to_line());
                        break;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(request, &state, &out_tx).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };
                    if out_tx.send(response.to_line()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        state.sessions.unregister(&session_id).await;
        info!("IPC connection closed");
    }
    .instrument(span)
    .await;

    drop(out_tx);
    let _ = writer_task.await;
}

/// Drain the outbound queue into the socket until every sender is gone.
async fn write_lines<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            warn!(%err, "failed to write ipc response");
            break;
        }
    }
    let _ = writer.flush().await;
}

/// Route an IPC command to its handler.
async fn dispatch_command<E: Executor + 'static>(
    mut request: IpcRequest,
    state: &IpcState<E>,
    out: &ConnectionSender,
) -> IpcResponse {
    let command = std::mem::take(&mut request.command);
    debug!(%command, "ipc command received");
    match command.as_str() {
        "run" => handle_run(request, state, out).await,
        "ask" => handle_ask(request, state).await,
        "list" => handle_list(state).await,
        "ping" => IpcResponse::success(serde_json::json!({ "pong": true })),
        other => IpcResponse::error(format!("unknown command: {other}")),
    }
}

/// Run a prompt, streaming every event back before the final response.
async fn handle_run<E: Executor + 'static>(
    request: IpcRequest,
    state: &IpcState<E>,
    out: &ConnectionSender,
) -> IpcResponse {
    let Some((key, agent_request)) = agent_request(request) else {
        return IpcResponse::error("missing required 'prompt' field");
    };

    let events = out.clone();
    let result = state
        .client
        .stream(&key, &agent_request, move |event| {
            // Connection gone; the final write will notice.
            let _ = events.send(IpcResponse::event(event).to_line());
        })
        .await;

    response_payload(&result)
}

/// Run a prompt through the bus and wait for its correlated reply.
async fn handle_ask<E>(request: IpcRequest, state: &IpcState<E>) -> IpcResponse
where
    E: Executor + 'static,
{
    let Some((key, agent_request)) = agent_request(request) else {
        return IpcResponse::error("missing required 'prompt' field");
    };

    let deadline = state.client.timeout_for(&agent_request) + ASK_REPLY_GRACE;
    let job = AgentJob {
        key,
        request: agent_request,
    };
    let result = match state.bus.submit(job, Some(deadline)).await {
        Ok(pending) => pending.await,
        Err(err) => Err(err),
    };
    response_payload(&result)
}

/// Split a `run`/`ask` line into its admission key and request; `None`
/// without a prompt.
fn agent_request(request: IpcRequest) -> Option<(String, AgentRequest)> {
    let prompt = request.prompt?;
    let key = request.key.unwrap_or_else(|| DEFAULT_KEY.to_owned());
    Some((
        key,
        AgentRequest {
            prompt,
            max_tokens: request.max_tokens,
            timeout_seconds: request.timeout_seconds,
        },
    ))
}

fn response_payload(result: &Result<AgentResponse>) -> IpcResponse {
    match result {
        Ok(response) => match serde_json::to_value(response) {
            Ok(value) => IpcResponse::success(serde_json::json!({ "response": value })),
            Err(err) => IpcResponse::error(format!("failed to encode response: {err}")),
        },
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

/// List live sessions.
async fn handle_list<E>(state: &IpcState<E>) -> IpcResponse {
    let sessions = state.sessions.list().await;
    match serde_json::to_value(&sessions) {
        Ok(items) => IpcResponse::success(serde_json::json!({ "sessions": items })),
        Err(err) => IpcResponse::error(format!("failed to list sessions: {err}")),
    }
}
