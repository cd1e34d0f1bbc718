//! CLI error types
//!
//! Everything that reaches `main` is fatal: the process prints it and exits
//! non-zero. Daemon-internal failures are logged and survived instead.

use thiserror::Error;

use crate::messaging::MessagingError;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Messaging(#[from] MessagingError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
