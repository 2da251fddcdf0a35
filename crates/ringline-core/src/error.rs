//! Error types for the Ringline orchestration core.

use thiserror::Error;

/// Result type alias for orchestration operations.
pub type RinglineResult<T> = Result<T, RinglineError>;

/// Errors that can occur in the call orchestration core.
///
/// The taxonomy matters for recovery: exhaustion is recoverable (requeue the
/// lead), external-service failures are retried with backoff up to a bounded
/// attempt count, protocol violations are logged and ignored, and a leak-guard
/// trip forces the call terminal. None of these crash the process; a call's
/// failure is isolated to that call's task.
#[derive(Error, Debug)]
pub enum RinglineError {
    #[error("pool exhausted: {0}")]
    Exhausted(String),

    #[error("telephony error: {0}")]
    Telephony(String),

    #[error("recognition error: {0}")]
    Recognition(String),

    #[error("language model error: {0}")]
    Language(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::Error> for RinglineError {
    fn from(err: sled::Error) -> Self {
        RinglineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RinglineError {
    fn from(err: serde_json::Error) -> Self {
        RinglineError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for RinglineError {
    fn from(err: config::ConfigError) -> Self {
        RinglineError::Config(err.to_string())
    }
}
