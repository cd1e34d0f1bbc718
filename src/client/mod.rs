//! One-shot clients
//!
//! Writers broadcast WRITE commands into the fanout exchange; readers run
//! quorum-style aggregation over the reply stream, resolving conflicts by
//! freshest timestamp.

mod reader;
mod writer;

pub use reader::{ReadAggregator, ReadOutcome, ReadTally, ResolvedLine};
pub use writer::LineWriter;
