//! Registry of long-lived interactive sessions.
//!
//! One entry per duplex connection. Every read of an entry doubles as a
//! keep-alive. Entries are removed on explicit close, by the idle sweep, or
//! when the registry shuts down. The registry never evicts to make room: at
//! capacity, registration fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::{AppError, Result};

#[derive(Debug)]
struct SessionEntry<C> {
    connection: C,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: String,
    /// When the session was registered.
    pub connected_at: DateTime<Utc>,
    /// Whole seconds since the last activity.
    pub idle_seconds: u64,
}

/// Concurrent map of session id → connection handle.
///
/// `C` is a cheap clonable reference to the connection (a channel sender,
/// an `Arc`), never the connection itself.
#[derive(Debug)]
pub struct SessionRegistry<C> {
    sessions: Mutex<HashMap<String, SessionEntry<C>>>,
    max_sessions: usize,
}

impl<C: Clone + Send + 'static> SessionRegistry<C> {
    /// Create an empty registry holding at most `max_sessions` entries.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Register `connection` under a freshly generated id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CapacityExceeded`] when the registry is full.
    pub async fn register(&self, connection: C) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.register_with_id(&session_id, connection).await?;
        Ok(session_id)
    }

    /// Register `connection` under an id derived from its identity.
    ///
    /// Re-registering an existing id replaces its connection and refreshes
    /// it without consuming extra capacity.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CapacityExceeded`] when the registry is full.
    pub async fn register_with_id(&self, session_id: &str, connection: C) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(session_id) && sessions.len() >= self.max_sessions {
            return Err(AppError::CapacityExceeded(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }

        sessions.insert(
            session_id.to_owned(),
            SessionEntry {
                connection,
                connected_at: Utc::now(),
                last_activity: Instant::now(),
            },
        );
        let active = sessions.len();
        drop(sessions);

        info!(session_id, active, "session registered");
        Ok(())
    }

    /// Look up a session's connection, refreshing its last activity.
    pub async fn get(&self, session_id: &str) -> Option<C> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session_id)?;
        entry.last_activity = Instant::now();
        Some(entry.connection.clone())
    }

    /// Refresh a session's last activity without reading it.
    ///
    /// Returns `false` if the session is unknown.
    pub async fn touch(&self, session_id: &str) -> bool {
        match self.sessions.lock().await.get_mut(session_id) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session. Idempotent.
    pub async fn unregister(&self, session_id: &str) {
        if self.sessions.lock().await.remove(session_id).is_some() {
            info!(session_id, "session unregistered");
        }
    }

    /// Remove every session idle for longer than `max_idle` and return how
    /// many were removed.
    ///
    /// Removed connections are not notified; the caller signals closure if
    /// it needs to.
    pub async fn cleanup(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session_id, entry| {
            let keep = now.saturating_duration_since(entry.last_activity) <= max_idle;
            if !keep {
                debug!(session_id, "evicting idle session");
            }
            keep
        });
        let removed = before - sessions.len();
        drop(sessions);

        if removed > 0 {
            info!(removed, "idle sessions evicted");
        }
        removed
    }

    /// Remove every session. Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.len();
        sessions.clear();
        info!(removed, "session registry cleared");
        removed
    }

    /// Snapshot of all sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(session_id, entry)| SessionInfo {
                session_id: session_id.clone(),
                connected_at: entry.connected_at,
                idle_seconds: now.saturating_duration_since(entry.last_activity).as_secs(),
            })
            .collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether there are no live sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

/// Spawn a background task that evicts sessions idle longer than
/// `max_idle`, checking every `period` until `cancel` fires.
#[must_use]
pub fn spawn_idle_sweeper<C: Clone + Send + Sync + 'static>(
    registry: Arc<SessionRegistry<C>>,
    max_idle: Duration,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("session idle sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.cleanup(max_idle).await;
                    }
                }
            }
        }
        .instrument(info_span!("session_idle_sweeper")),
    )
}
