//! CLI module for fanline
//!
//! Subcommands:
//! - broker: run the embedded broker
//! - replica: run a replica daemon
//! - write: broadcast one WRITE, or loop over stdin
//! - read-last: quorum read resolved by freshest timestamp
//! - read-all: collect every replica's full listing
//! - status: one-shot liveness probe

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use errors::{CliError, CliResult};

use clap::Parser;

/// Parse arguments and dispatch. The only entry point `main` calls.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse();
    commands::dispatch(cli)
}
