use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Request coalescing error: {0}")]
    Dedup(#[from] DedupError<UpstreamFailure>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RelayError {
    /// True when the caller should back off instead of retrying immediately.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, RelayError::Dedup(DedupError::Overflow { .. }))
    }
}

/// Outcome classes reported by the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The overall request deadline elapsed (reported as 408).
    Timeout,
    /// Connection, TLS or protocol failure (reported as 500).
    Transport,
    /// The upstream answered with a non-success status.
    Upstream,
    /// Anything else, including unreadable success bodies (reported as 500).
    Unexpected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::Upstream => "upstream",
            FailureKind::Unexpected => "unexpected",
        };
        f.write_str(tag)
    }
}

/// Structured upstream failure, cloned to every caller coalesced onto it.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} failure ({status_code}): {message}")]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub status_code: u16,
    pub message: String,
}

impl UpstreamFailure {
    pub fn new(kind: FailureKind, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(FailureKind::Timeout, 408, "Request timeout")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, 500, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unexpected, 500, message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum DedupError<E> {
    /// The pending table is full; the caller must apply backpressure.
    #[error("Too many pending requests ({pending}/{max_pending})")]
    Overflow { pending: usize, max_pending: usize },

    /// The in-flight execution was cancelled deliberately.
    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request failed: {0}")]
    Failed(E),

    /// The leader's task ended without publishing an outcome.
    #[error("Leader execution ended without a result")]
    LeaderLost,

    #[error("Pending request table is poisoned")]
    Poisoned,

    #[error("Deduplicator has been shut down")]
    ShutDown,
}

impl<E> DedupError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DedupError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported pattern: {0}")]
    Pattern(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
