//! CLI command implementations
//!
//! Daemons (`broker`, `replica`) log and continue; one-shot clients report
//! aggregate results on stdout and exit. Each command builds its own tokio
//! runtime so `main` stays synchronous.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use crate::broker::Broker;
use crate::client::{LineWriter, ReadAggregator};
use crate::config::Config;
use crate::messaging::{BrokerConnection, ReplyRouter};
use crate::observability::Logger;
use crate::replica::ReplicaHandler;
use crate::store::MemoryStore;

pub fn dispatch(cli: Cli) -> CliResult<()> {
    let mut cfg = Config::from_env();
    if let Some(broker) = cli.broker {
        cfg.broker_addr = broker;
    }
    let runtime = Runtime::new()?;

    match cli.command {
        Command::Broker { listen } => {
            let listen = listen.unwrap_or_else(|| cfg.broker_addr.clone());
            runtime.block_on(run_broker(listen))
        }
        Command::Replica { id } => runtime.block_on(run_replica(cfg, id)),
        Command::Write {
            line: Some(line),
            content,
        } => runtime.block_on(write_once(cfg, line, content.join(" "))),
        Command::Write {
            line: None,
            content: _,
        } => runtime.block_on(write_loop(cfg)),
        Command::ReadLast => runtime.block_on(read_last(cfg)),
        Command::ReadAll => runtime.block_on(read_all(cfg)),
        Command::Status => runtime.block_on(status(cfg)),
    }
}

async fn run_broker(listen: String) -> CliResult<()> {
    let broker = Broker::bind(&listen).await?;
    broker.run().await?;
    Ok(())
}

async fn run_replica(cfg: Config, id: u32) -> CliResult<()> {
    if id == 0 {
        return Err(CliError::InvalidInput(
            "replica id must be a positive integer".to_string(),
        ));
    }
    Logger::info("replica_starting", &[("replica", &id.to_string())]);
    let conn = match BrokerConnection::connect(cfg).await {
        Ok(conn) => conn,
        Err(e) => {
            Logger::fatal(
                "replica_start_failed",
                &[("replica", &id.to_string()), ("reason", &e.to_string())],
            );
            return Err(e.into());
        }
    };
    let handler = ReplicaHandler::start(Arc::clone(&conn), id, Arc::new(MemoryStore::new())).await?;
    handler.run().await?;
    Ok(())
}

async fn write_once(cfg: Config, line: i64, content: String) -> CliResult<()> {
    if content.is_empty() {
        return Err(CliError::InvalidInput(
            "WRITE needs content after the line number".to_string(),
        ));
    }
    let conn = BrokerConnection::connect(cfg).await?;
    LineWriter::new(Arc::clone(&conn))
        .write_line(line, &content)
        .await?;
    conn.close().await;
    Ok(())
}

/// Interactive writer: `<lineNumber> <content>` per input line, `exit`
/// to quit.
async fn write_loop(cfg: Config) -> CliResult<()> {
    let conn = BrokerConnection::connect(cfg).await?;
    let writer = LineWriter::new(Arc::clone(&conn));

    println!("Enter lines as '<lineNumber> <content>' ('READ ALL' to broadcast, 'exit' to quit):");
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = input.next_line().await? {
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("read all") {
            writer.broadcast_read_all().await?;
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let number = parts.next().unwrap_or_default().parse::<i64>();
        match (number, parts.next()) {
            (Ok(number), Some(content)) => writer.write_line(number, content).await?,
            _ => println!("Invalid input format! Use: <lineNumber> <content>"),
        }
    }
    conn.close().await;
    Ok(())
}

async fn read_last(cfg: Config) -> CliResult<()> {
    let conn = BrokerConnection::connect(cfg).await?;
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    println!("Waiting for replica responses...");
    let outcome = aggregator.read_last().await?;
    println!("{}", outcome.summary());
    conn.close().await;
    Ok(())
}

async fn read_all(cfg: Config) -> CliResult<()> {
    let conn = BrokerConnection::connect(cfg).await?;
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    println!("Waiting for replica responses...");
    let replies = aggregator.read_all().await?;
    if replies.is_empty() {
        println!("No responses received from any replica");
    }
    for reply in &replies {
        match (&reply.lines, &reply.error) {
            (Some(lines), _) => {
                println!("Replica {} ({} line(s)):", reply.replica_id, lines.len());
                for line in lines {
                    println!("  {}: {}", line.line_number, line.content);
                }
            }
            (None, Some(error)) => {
                println!("Replica {} reported an error: {}", reply.replica_id, error)
            }
            (None, None) => println!("Replica {} sent no listing", reply.replica_id),
        }
    }
    conn.close().await;
    Ok(())
}

async fn status(cfg: Config) -> CliResult<()> {
    let conn = BrokerConnection::connect(cfg).await?;
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    match aggregator.status_probe().await? {
        Some(reply) => println!(
            "Replica {} is {} on queue {} with {} line(s)",
            reply.replica_id,
            reply.status.as_deref().unwrap_or("unknown"),
            reply.queue_name.as_deref().unwrap_or("?"),
            reply.line_count.unwrap_or(0)
        ),
        None => println!("No status reply within the response window"),
    }
    conn.close().await;
    Ok(())
}
