//! CLI argument definitions using clap
//!
//! Commands:
//! - fanline broker [--listen <addr>]
//! - fanline replica --id <n>
//! - fanline write [<line> <content>...]
//! - fanline read-last
//! - fanline read-all
//! - fanline status

use clap::{Parser, Subcommand};

/// fanline - append-only text line replication over a fanout broker
#[derive(Parser, Debug)]
#[command(name = "fanline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Broker address (host:port); overrides FANLINE_BROKER_ADDR.
    #[arg(long, global = true)]
    pub broker: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the embedded message broker
    Broker {
        /// Listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a replica daemon with an in-memory store
    Replica {
        /// Distinct positive replica ID; names the durable queue
        #[arg(long)]
        id: u32,
    },

    /// Broadcast a WRITE; with no arguments, read `<line> <content>` pairs
    /// from stdin until `exit`
    Write {
        /// Line number
        line: Option<i64>,
        /// Line content (may contain spaces)
        #[arg(trailing_var_arg = true)]
        content: Vec<String>,
    },

    /// Quorum read: freshest line across replicas
    ReadLast,

    /// Collect every replica's full listing
    ReadAll,

    /// One-shot liveness probe (first replica to answer)
    Status,
}
