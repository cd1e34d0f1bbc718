//! Record store contract
//!
//! The messaging core never touches persistence except through `LineStore`.
//! Real deployments plug in whatever backend they want; the crate ships an
//! in-memory implementation for replicas, demos and tests.

mod memory;

pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One replicated text line. Append-only: a WRITE always inserts a new
/// record, never mutates an existing one in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineRecord {
    pub line_number: i64,
    pub content: String,
    /// Epoch milliseconds at append time; the last-writer-wins tiebreaker.
    pub written_at: i64,
}

/// Storage collaborator failure. Propagated to the message handler, replied
/// as an error envelope; never halts the consumer loop.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal persistence contract consumed by the replica handler.
///
/// The store serializes its own writes; a replica is a single in-order
/// consumer of its queue, so there is no intra-replica write race.
pub trait LineStore: Send + Sync + 'static {
    /// Append a new record. Never overwrites.
    fn append(&self, line_number: i64, content: &str, written_at: i64) -> StoreResult<()>;

    /// The most recently appended record, or `None` for an empty store.
    fn most_recent(&self) -> StoreResult<Option<LineRecord>>;

    /// All records ordered by line number ascending.
    fn all(&self) -> StoreResult<Vec<LineRecord>>;
}

impl<S: LineStore> LineStore for std::sync::Arc<S> {
    fn append(&self, line_number: i64, content: &str, written_at: i64) -> StoreResult<()> {
        (**self).append(line_number, content, written_at)
    }

    fn most_recent(&self) -> StoreResult<Option<LineRecord>> {
        (**self).most_recent()
    }

    fn all(&self) -> StoreResult<Vec<LineRecord>> {
        (**self).all()
    }
}
