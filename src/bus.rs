//! In-process message bus gateway.
//!
//! Requests and replies travel on separate channels. Each request carries
//! [`CorrelationMetadata`] alongside its body; the worker answers on the
//! reply channel with the same correlation id, and the reply listener
//! resolves the submitter's [`PendingReply`] through the
//! [`CorrelationEngine`].
//!
//! ```text
//! submit ──► requests ──► worker ──► handler
//!   │                                   │
//!   ▼                                   ▼
//! PendingReply ◄── engine ◄── listener ◄── replies
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{AgentClient, AgentRequest, DEFAULT_KEY};
use crate::correlation::{CorrelationEngine, CorrelationMetadata, PendingReply};
use crate::process::Executor;
use crate::stream::AgentResponse;
use crate::{AppError, Result};

/// Reply address used by [`BusGateway`] for its own listener.
pub const REPLY_ADDRESS: &str = "conduit.replies";

/// A request body with its correlation metadata.
#[derive(Debug, Clone)]
pub struct BusMessage<B> {
    /// Correlation id and reply address.
    pub metadata: CorrelationMetadata,
    /// The request payload.
    pub body: B,
}

/// A reply addressed to the submitter of a correlated request.
#[derive(Debug, Clone)]
pub struct BusReply<R> {
    /// Id copied from the request's metadata.
    pub correlation_id: String,
    /// Handler outcome.
    pub result: Result<R>,
}

/// Something the worker can answer requests with.
pub trait BusHandler<B, R>: Send + Sync {
    /// Produce the reply for one request body.
    fn handle(&self, body: B) -> Pin<Box<dyn Future<Output = Result<R>> + Send + '_>>;
}

/// An agent request routed through the bus, with its admission key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentJob {
    /// Admission pool the worker acquires from.
    pub key: String,
    /// The prompt and its limits.
    pub request: AgentRequest,
}

impl AgentJob {
    /// A job in the default admission pool.
    #[must_use]
    pub fn new(request: AgentRequest) -> Self {
        Self {
            key: DEFAULT_KEY.to_owned(),
            request,
        }
    }
}

/// Gateway type the binary runs: agent jobs in, agent responses out.
pub type AgentBus = BusGateway<AgentJob, AgentResponse>;

impl<E: Executor> BusHandler<AgentJob, AgentResponse> for AgentClient<E> {
    fn handle(
        &self,
        body: AgentJob,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse>> + Send + '_>> {
        Box::pin(async move { self.ask(&body.key, &body.request).await })
    }
}

/// Submitting side of the bus.
#[derive(Debug)]
pub struct BusGateway<B, R> {
    requests: mpsc::Sender<BusMessage<B>>,
    engine: Arc<CorrelationEngine<R>>,
    reply_to: String,
}

impl<B, R> Clone for BusGateway<B, R> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            engine: Arc::clone(&self.engine),
            reply_to: self.reply_to.clone(),
        }
    }
}

impl<B: Send + 'static, R: Send + 'static> BusGateway<B, R> {
    /// Wire a gateway, worker, and reply listener around `handler`.
    ///
    /// Both background tasks stop when `cancel` fires or their channel
    /// closes. `capacity` bounds each channel.
    #[must_use]
    pub fn start<H>(
        handler: Arc<H>,
        engine: Arc<CorrelationEngine<R>>,
        capacity: usize,
        cancel: &CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        H: BusHandler<B, R> + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        let (reply_tx, reply_rx) = mpsc::channel(capacity.max(1));

        let worker = spawn_worker(handler, request_rx, reply_tx, cancel.child_token());
        let listener = spawn_reply_listener(Arc::clone(&engine), reply_rx, cancel.child_token());

        let gateway = Self {
            requests: request_tx,
            engine,
            reply_to: REPLY_ADDRESS.to_owned(),
        };
        (gateway, vec![worker, listener])
    }

    /// Publish `body` and return the awaitable reply.
    ///
    /// `timeout` defaults to the engine's correlation timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] if the engine is shut down or the
    /// worker is gone.
    pub async fn submit(&self, body: B, timeout: Option<Duration>) -> Result<PendingReply<R>> {
        let pending = self.engine.register_new(timeout).await?;
        let message = BusMessage {
            metadata: CorrelationMetadata {
                correlation_id: pending.id().to_owned(),
                reply_to: self.reply_to.clone(),
            },
            body,
        };

        if self.requests.send(message).await.is_err() {
            let error = AppError::Shutdown("bus worker is not running".into());
            self.engine.fail(pending.id(), error.clone()).await;
            return Err(error);
        }
        debug!(correlation_id = pending.id(), "bus request published");
        Ok(pending)
    }

    /// The engine resolving this gateway's replies.
    #[must_use]
    pub fn engine(&self) -> &Arc<CorrelationEngine<R>> {
        &self.engine
    }
}

/// Spawn the worker that answers each request on its own task.
///
/// Handlers run concurrently; a slow request does not hold up the rest.
/// On cancellation every in-flight handler is dropped, its submitter is
/// sent a [`AppError::Shutdown`] reply when the reply channel still has
/// room, and the returned handle resolves once all of them have stopped.
#[must_use]
pub fn spawn_worker<B, R, H>(
    handler: Arc<H>,
    mut requests: mpsc::Receiver<BusMessage<B>>,
    replies: mpsc::Sender<BusReply<R>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    B: Send + 'static,
    R: Send + 'static,
    H: BusHandler<B, R> + 'static,
{
    tokio::spawn(
        async move {
            let in_flight = TaskTracker::new();
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = requests.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let BusMessage { metadata, body } = message;
                let handler = Arc::clone(&handler);
                let replies = replies.clone();
                let cancel = cancel.clone();
                let span = info_span!(
                    "bus_request",
                    correlation_id = %metadata.correlation_id,
                    reply_to = %metadata.reply_to
                );
                let correlation_id = metadata.correlation_id;
                in_flight.spawn(
                    async move {
                        let result = tokio::select! {
                            result = handler.handle(body) => result,
                            () = cancel.cancelled() => {
                                debug!("bus worker cancelled, abandoning request");
                                let reply = BusReply {
                                    correlation_id,
                                    result: Err(AppError::Shutdown(
                                        "bus worker stopped before replying".into(),
                                    )),
                                };
                                if replies.try_send(reply).is_err() {
                                    debug!("reply channel unavailable, shutdown reply dropped");
                                }
                                return;
                            }
                        };
                        let reply = BusReply {
                            correlation_id,
                            result,
                        };
                        if replies.send(reply).await.is_err() {
                            warn!("reply channel closed, dropping reply");
                        }
                    }
                    .instrument(span),
                );
            }

            in_flight.close();
            in_flight.wait().await;
            info!("bus worker stopped");
        }
        .instrument(info_span!("bus_worker")),
    )
}

/// Spawn the listener that routes replies into `engine`.
///
/// Replies for unknown or already-resolved ids are logged and dropped.
#[must_use]
pub fn spawn_reply_listener<R: Send + 'static>(
    engine: Arc<CorrelationEngine<R>>,
    mut replies: mpsc::Receiver<BusReply<R>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let reply = tokio::select! {
                    () = cancel.cancelled() => break,
                    reply = replies.recv() => match reply {
                        Some(reply) => reply,
                        None => break,
                    },
                };

                let delivered = match reply.result {
                    Ok(value) => engine.complete(&reply.correlation_id, value).await,
                    Err(err) => engine.fail(&reply.correlation_id, err).await,
                };
                if !delivered {
                    debug!(
                        correlation_id = %reply.correlation_id,
                        "late or unknown reply discarded"
                    );
                }
            }
            info!("bus reply listener stopped");
        }
        .instrument(info_span!("bus_reply_listener")),
    )
}
