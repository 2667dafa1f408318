//! # Relay Error Types Module
//!
//! This module defines the error types shared by the main bot and the worker bots.
//! It separates transport failures (broker, decoding) from failures of the
//! services a task is delegated to, so handlers can pick a user-facing message.

/// Custom error types for task relay operations
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Pub/sub or key-value broker errors
    Broker(String),
    /// Payload decoding errors
    Decode(String),
    /// Waiting for a result or an upstream call took too long
    Timeout(String),
    /// Errors returned by an upstream AI service
    Upstream(String),
    /// The upstream service refused the request itself (bad request, blocked content)
    Rejected(String),
    /// The uploaded file cannot be processed
    Unsupported(String),
    /// Drive, Slack or Notion integration errors
    Integration(String),
    /// Circuit breaker is rejecting calls
    CircuitOpen(String),
    /// Local file system errors
    Io(String),
}

impl RelayError {
    /// Localization key describing this error to a user
    pub fn message_key(&self) -> &'static str {
        match self {
            RelayError::Broker(_) => "error-broker",
            RelayError::Decode(_) => "error-decode",
            RelayError::Timeout(_) => "error-timeout",
            RelayError::Upstream(_) => "error-upstream",
            RelayError::Rejected(_) => "error-rejected",
            RelayError::Unsupported(_) => "error-unsupported-format",
            RelayError::Integration(_) => "error-integration",
            RelayError::CircuitOpen(_) => "error-circuit-open",
            RelayError::Io(_) => "error-io",
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Broker(_) | RelayError::Timeout(_) | RelayError::Upstream(_)
        )
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Broker(msg) => write!(f, "Broker error: {msg}"),
            RelayError::Decode(msg) => write!(f, "Decode error: {msg}"),
            RelayError::Timeout(msg) => write!(f, "Timeout error: {msg}"),
            RelayError::Upstream(msg) => write!(f, "Upstream error: {msg}"),
            RelayError::Rejected(msg) => write!(f, "Rejected request: {msg}"),
            RelayError::Unsupported(msg) => write!(f, "Unsupported input: {msg}"),
            RelayError::Integration(msg) => write!(f, "Integration error: {msg}"),
            RelayError::CircuitOpen(msg) => write!(f, "Circuit open: {msg}"),
            RelayError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::Upstream(err.to_string())
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}
