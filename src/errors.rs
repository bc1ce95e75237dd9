//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Errors are `Clone` so a single failure can be delivered to a pending
/// correlation awaitable and replayed across retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The agent binary could not be started.
    Launch {
        /// Human-readable cause, including the OS error.
        message: String,
        /// Whether a retry may plausibly succeed (false for a missing or
        /// non-executable binary).
        transient: bool,
    },
    /// The process exceeded its wall-clock budget and was killed.
    Timeout(String),
    /// A stream line failed structured decoding.
    ProtocolDecode(String),
    /// The agent ran but its response did not end in a completion.
    AgentFailed(String),
    /// No reply arrived before a pending request expired.
    CorrelationTimeout(String),
    /// A permit pool or the session registry is full.
    CapacityExceeded(String),
    /// Operation attempted against a torn-down component.
    Shutdown(String),
    /// The operation was cancelled by its caller.
    Cancelled(String),
    /// An identifier is already in use.
    Conflict(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Local socket communication failure.
    Ipc(String),
    /// File-system or process I/O failure.
    Io(String),
}

impl AppError {
    /// Whether the default retry policy considers this failure worth
    /// another attempt.
    ///
    /// Only process I/O failures and launch failures flagged transient
    /// qualify; timeouts never do.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Launch { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Build a [`AppError::Launch`] from a spawn failure, classifying a
    /// missing or non-executable binary as fatal.
    #[must_use]
    pub fn launch(err: &std::io::Error) -> Self {
        let transient = !matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        );
        Self::Launch {
            message: format!("failed to spawn agent: {err}"),
            transient,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch { message, .. } => write!(f, "launch: {message}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::ProtocolDecode(msg) => write!(f, "protocol decode: {msg}"),
            Self::AgentFailed(msg) => write!(f, "agent failed: {msg}"),
            Self::CorrelationTimeout(msg) => write!(f, "correlation timeout: {msg}"),
            Self::CapacityExceeded(msg) => write!(f, "capacity exceeded: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
