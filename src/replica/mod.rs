//! Replica daemon
//!
//! Each replica owns one durable queue bound to the fanout exchange and one
//! local store, applying every broadcast command to its own copy of the
//! data.

mod handler;

pub use handler::{apply_command, apply_payload, ReplicaHandler};
