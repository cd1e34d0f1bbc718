//! fanline - append-only text line replication over a fanout message broker
//!
//! Writes are broadcast through a fanout exchange to one durable queue per
//! replica; reads are request/reply with correlation IDs, resolved
//! last-writer-wins by timestamp on the client side.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod messaging;
pub mod observability;
pub mod replica;
pub mod store;
pub mod wire;
