//! Observability
//!
//! Structured logging for daemons and one-shot clients. Logging is
//! synchronous and side-effect free with respect to the protocol: a failed
//! write to stdout never fails an operation.

mod logger;

pub use logger::{Logger, Severity};
