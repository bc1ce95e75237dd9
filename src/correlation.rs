//! Correlation engine for decoupled request/reply.
//!
//! A sender registers a correlation id and receives a [`PendingReply`]; the
//! reply travels on some other channel carrying the id as metadata, and
//! whoever receives it calls [`CorrelationEngine::complete`] (or
//! [`fail`](CorrelationEngine::fail)). Each id goes through
//!
//! ```text
//! Registered ──► Resolved | Failed | Expired   (then removed)
//! ```
//!
//! exactly once. Only the first of {reply, failure, expiry} wins; later
//! attempts return `false`.
//!
//! The engine is generic over the reply type, so the "expected response
//! type" of a registration is the type parameter itself.
//!
//! Expired entries are failed by [`sweep_expired`](CorrelationEngine::sweep_expired),
//! which the background task started by [`CorrelationEngine::start`] calls
//! on a fixed period until [`shutdown`](CorrelationEngine::shutdown).

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::CorrelationConfig;
use crate::{AppError, Result};

/// Correlation data carried as message metadata, never inside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationMetadata {
    /// Opaque id linking the reply to its request.
    pub correlation_id: String,
    /// Where the reply should be delivered.
    pub reply_to: String,
}

// ── Pending state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingEntry<T> {
    sender: oneshot::Sender<Result<T>>,
    expires_at: Instant,
}

#[derive(Debug)]
struct State<T> {
    entries: HashMap<String, PendingEntry<T>>,
    closed: bool,
}

/// Awaitable reply for a registered correlation id.
///
/// Resolves exactly once: with the completed value, the failure passed to
/// [`CorrelationEngine::fail`], [`AppError::CorrelationTimeout`] on expiry,
/// or [`AppError::Shutdown`] when the engine shuts down.
#[derive(Debug)]
pub struct PendingReply<T> {
    id: String,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> PendingReply<T> {
    /// The correlation id this reply is waiting on.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(AppError::Shutdown(
                    "correlation engine dropped before a reply arrived".into(),
                ))
            })
        })
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Tracks pending replies of type `T` keyed by correlation id.
#[derive(Debug)]
pub struct CorrelationEngine<T> {
    state: Mutex<State<T>>,
    default_timeout: Duration,
    sweeper: CancellationToken,
}

impl<T: Send + 'static> CorrelationEngine<T> {
    /// Create an engine without a background sweeper.
    ///
    /// Expired entries are only reaped when [`sweep_expired`](Self::sweep_expired)
    /// is called.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                closed: false,
            }),
            default_timeout,
            sweeper: CancellationToken::new(),
        }
    }

    /// Create an engine and start its periodic expiry sweep.
    ///
    /// The sweep task holds only a weak reference; it stops on
    /// [`shutdown`](Self::shutdown) or when the last `Arc` is dropped.
    #[must_use]
    pub fn start(config: &CorrelationConfig) -> Arc<Self> {
        let engine = Arc::new(Self::new(config.default_timeout()));
        spawn_sweeper(
            Arc::downgrade(&engine),
            config.sweep_interval(),
            engine.sweeper.clone(),
        );
        engine
    }

    /// Issue a new globally unique correlation id.
    #[must_use]
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register `id` and return its awaitable reply.
    ///
    /// `timeout` defaults to the engine's configured correlation timeout.
    ///
    /// # Errors
    ///
    /// - [`AppError::Conflict`] if `id` is already pending.
    /// - [`AppError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub async fn register(
        &self,
        id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<PendingReply<T>> {
        let id = id.into();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let now = Instant::now();

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AppError::Shutdown(
                "correlation engine is shut down".into(),
            ));
        }

        if let Some(existing) = state.entries.get(&id) {
            if existing.expires_at > now {
                return Err(AppError::Conflict(format!(
                    "correlation id '{id}' is already pending"
                )));
            }
            if let Some(stale) = state.entries.remove(&id) {
                expire(&id, stale);
            }
        }

        let (sender, receiver) = oneshot::channel();
        state.entries.insert(
            id.clone(),
            PendingEntry {
                sender,
                expires_at: now + timeout,
            },
        );
        drop(state);

        debug!(
            correlation_id = %id,
            reply_type = type_name::<T>(),
            ?timeout,
            "pending reply registered"
        );
        Ok(PendingReply { id, receiver })
    }

    /// Generate an id and register it in one step.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub async fn register_new(&self, timeout: Option<Duration>) -> Result<PendingReply<T>> {
        self.register(Self::generate_id(), timeout).await
    }

    /// Resolve `id` with `value`.
    ///
    /// Returns `false` when `id` is unknown, already resolved, or already
    /// past its expiry; a stale id is an expected race, not an error.
    pub async fn complete(&self, id: &str, value: T) -> bool {
        let Some(entry) = self.take_live(id).await else {
            return false;
        };
        if entry.sender.send(Ok(value)).is_err() {
            debug!(correlation_id = id, "reply completed but awaitable was dropped");
        }
        debug!(correlation_id = id, "pending reply completed");
        true
    }

    /// Fail `id` with `error`. Same idempotency contract as
    /// [`complete`](Self::complete).
    pub async fn fail(&self, id: &str, error: AppError) -> bool {
        let Some(entry) = self.take_live(id).await else {
            return false;
        };
        debug!(correlation_id = id, %error, "pending reply failed");
        if entry.sender.send(Err(error)).is_err() {
            debug!(correlation_id = id, "reply failed but awaitable was dropped");
        }
        true
    }

    /// Fail every entry whose expiry has passed with
    /// [`AppError::CorrelationTimeout`]. Returns how many expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, PendingEntry<T>)> = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            expire(&id, entry);
        }
        if count > 0 {
            info!(expired = count, "correlation sweep expired pending replies");
        }
        count
    }

    /// Fail every pending reply with [`AppError::Shutdown`], stop the sweep,
    /// and refuse further registrations. Returns how many were pending.
    pub async fn shutdown(&self) -> usize {
        self.sweeper.cancel();
        let drained: Vec<(String, PendingEntry<T>)> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            let error = AppError::Shutdown(format!(
                "correlation engine shut down before reply to '{id}'"
            ));
            // The awaitable may already be gone; nothing left to notify.
            let _ = entry.sender.send(Err(error));
        }
        info!(failed = count, "correlation engine shut down");
        count
    }

    /// Number of replies still pending.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether `id` is currently pending.
    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.entries.contains_key(id)
    }

    /// Remove `id` if it is pending; an entry found past its expiry is
    /// expired on the spot and not returned.
    async fn take_live(&self, id: &str) -> Option<PendingEntry<T>> {
        let entry = self.state.lock().await.entries.remove(id);
        let Some(entry) = entry else {
            debug!(correlation_id = id, "no pending reply for correlation id");
            return None;
        };
        if entry.expires_at <= Instant::now() {
            expire(id, entry);
            return None;
        }
        Some(entry)
    }
}

impl<T> Drop for CorrelationEngine<T> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

fn expire<T>(id: &str, entry: PendingEntry<T>) {
    warn!(correlation_id = id, "pending reply expired without a reply");
    let error = AppError::CorrelationTimeout(format!("no reply for '{id}' before expiry"));
    // The awaitable may already be gone; nothing left to notify.
    let _ = entry.sender.send(Err(error));
}

fn spawn_sweeper<T: Send + 'static>(
    engine: Weak<CorrelationEngine<T>>,
    period: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("correlation sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        engine.sweep_expired().await;
                    }
                }
            }
        }
        .instrument(info_span!("correlation_sweeper")),
    );
}
