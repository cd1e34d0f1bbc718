//! Messaging error types

use std::time::Duration;

use thiserror::Error;

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Failures in the protocol layer.
///
/// `ConnectionExhausted` is fatal to the attempting call; a later call may
/// still succeed by reconnecting. `ControlTimeout` bounds a broker round
/// trip — replica reply timeouts are not errors and surface as no-answer
/// results instead.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to connect to broker at {addr} after {attempts} attempt(s): {reason}")]
    ConnectionExhausted {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("broker connection is closed")]
    Disconnected,

    #[error("broker rejected the operation: {0}")]
    Broker(String),

    #[error("unexpected broker frame: {0}")]
    Protocol(String),

    #[error("no broker response within {0:?}")]
    ControlTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
