//! Per-replica command handling
//!
//! The pure core (`apply_payload` / `apply_command`) turns one incoming
//! payload into one reply against the store; the handler wraps it in the
//! consumer loop, direct replies, and logging. Failures are isolated per
//! message: a bad payload or store error produces an error reply (or a
//! logged drop when there is nowhere to reply) and the loop continues.

use std::sync::Arc;

use crate::messaging::{BrokerConnection, MessagingResult};
use crate::observability::Logger;
use crate::store::LineStore;
use crate::wire::{now_millis, Command, CommandError, Delivery, ReplicaReply};

/// Interpret a raw payload against the store. Parse failures become error
/// replies; they never reach the store.
pub fn apply_payload<S: LineStore>(
    store: &S,
    replica_id: u32,
    queue: &str,
    payload: &str,
) -> ReplicaReply {
    match Command::parse(payload) {
        Ok(command) => apply_command(store, replica_id, queue, &command),
        Err(e @ CommandError::Format(_)) => ReplicaReply::failure(replica_id, e.to_string()),
        Err(CommandError::Unknown(raw)) => ReplicaReply::unknown(replica_id, &raw),
    }
}

/// Apply one parsed command. WRITE is the only store-mutating branch and is
/// a single logical append; reads and status probes never mutate.
pub fn apply_command<S: LineStore>(
    store: &S,
    replica_id: u32,
    queue: &str,
    command: &Command,
) -> ReplicaReply {
    match command {
        Command::Write {
            line_number,
            content,
        } => match store.append(*line_number, content, now_millis()) {
            Ok(()) => ReplicaReply::write_success(replica_id, *line_number),
            Err(e) => ReplicaReply::failure(replica_id, e.to_string()),
        },

        Command::ReadLast => match store.most_recent() {
            Ok(Some(record)) => ReplicaReply::last_line(replica_id, &record),
            Ok(None) => ReplicaReply::empty(replica_id),
            Err(e) => ReplicaReply::failure(replica_id, e.to_string()),
        },

        Command::ReadAll => match store.all() {
            Ok(records) => ReplicaReply::all_lines(replica_id, &records),
            Err(e) => ReplicaReply::failure(replica_id, e.to_string()),
        },

        Command::Status | Command::Heartbeat => match store.all() {
            Ok(records) => ReplicaReply::status(replica_id, queue, records.len(), now_millis()),
            Err(e) => ReplicaReply::failure(replica_id, e.to_string()),
        },
    }
}

/// The replica's consumer: one in-order reader of its own queue, so no
/// intra-replica write race exists.
pub struct ReplicaHandler<S: LineStore> {
    replica_id: u32,
    queue: String,
    conn: Arc<BrokerConnection>,
    store: S,
}

impl<S: LineStore> ReplicaHandler<S> {
    /// Declare and bind this replica's durable queue.
    pub async fn start(
        conn: Arc<BrokerConnection>,
        replica_id: u32,
        store: S,
    ) -> MessagingResult<Self> {
        let queue = conn.declare_replica_queue(replica_id).await?;
        Logger::info(
            "replica_queue_declared",
            &[("replica", &replica_id.to_string()), ("queue", &queue)],
        );
        Ok(Self {
            replica_id,
            queue,
            conn,
            store,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Consume the queue until the connection is closed for good.
    pub async fn run(self) -> MessagingResult<()> {
        let prefetch = self.conn.config().prefetch_count;
        let mut deliveries = self.conn.consume(&self.queue, prefetch).await?;
        Logger::info(
            "replica_ready",
            &[
                ("replica", &self.replica_id.to_string()),
                ("queue", &self.queue),
            ],
        );
        while let Some(delivery) = deliveries.recv().await {
            self.handle_delivery(delivery).await;
        }
        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let replica = self.replica_id.to_string();
        let correlation_id = delivery
            .properties
            .correlation_id
            .clone()
            .unwrap_or_default();
        Logger::info(
            "replica_received",
            &[
                ("replica", replica.as_str()),
                ("correlation_id", correlation_id.as_str()),
                ("command", delivery.payload.as_str()),
            ],
        );

        let reply = apply_payload(&self.store, self.replica_id, &self.queue, &delivery.payload);
        let failed = reply.error.is_some();

        match &delivery.properties.reply_to {
            Some(reply_to) => {
                if let Err(e) = self
                    .conn
                    .publish_direct(
                        reply_to,
                        &reply.encode(),
                        delivery.properties.correlation_id.as_deref(),
                    )
                    .await
                {
                    Logger::error(
                        "replica_reply_failed",
                        &[
                            ("replica", replica.as_str()),
                            ("correlation_id", correlation_id.as_str()),
                            ("reason", &e.to_string()),
                        ],
                    );
                }
            }
            None if failed => {
                // Nowhere to report the failure; log and drop.
                Logger::warn(
                    "replica_dropped_failure",
                    &[
                        ("replica", replica.as_str()),
                        ("command", delivery.payload.as_str()),
                        ("error", reply.error.as_deref().unwrap_or_default()),
                    ],
                );
            }
            None => {}
        }

        let event = if failed {
            "replica_failed"
        } else {
            "replica_processed"
        };
        Logger::info(
            event,
            &[
                ("replica", replica.as_str()),
                ("correlation_id", correlation_id.as_str()),
                ("command", delivery.payload.as_str()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const QUEUE: &str = "replica_queue_1";

    #[test]
    fn test_write_appends_and_acknowledges() {
        let store = MemoryStore::new();
        let before = now_millis();
        let reply = apply_payload(&store, 1, QUEUE, "WRITE 1 Hello");

        assert_eq!(reply.status.as_deref(), Some("success"));
        assert_eq!(reply.line_number, Some(1));
        let record = store.most_recent().unwrap().unwrap();
        assert_eq!(record.line_number, 1);
        assert_eq!(record.content, "Hello");
        assert!(record.written_at >= before);
    }

    #[test]
    fn test_malformed_write_is_format_error_without_store_record() {
        let store = MemoryStore::new();
        let reply = apply_payload(&store, 1, QUEUE, "WRITE abc");

        assert!(reply.error.is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_read_last_on_empty_store() {
        let store = MemoryStore::new();
        let reply = apply_payload(&store, 2, QUEUE, "READ LAST");
        assert_eq!(reply.replica_id, 2);
        assert_eq!(reply.empty, Some(true));
    }

    #[test]
    fn test_reads_never_mutate_the_store() {
        let store = MemoryStore::new();
        apply_payload(&store, 1, QUEUE, "WRITE 1 one");
        apply_payload(&store, 1, QUEUE, "WRITE 2 two");
        let snapshot = store.all().unwrap();

        for _ in 0..3 {
            apply_payload(&store, 1, QUEUE, "READ LAST");
            apply_payload(&store, 1, QUEUE, "READ ALL");
            apply_payload(&store, 1, QUEUE, "STATUS");
            apply_payload(&store, 1, QUEUE, "HEARTBEAT");
        }

        assert_eq!(store.all().unwrap(), snapshot);
    }

    #[test]
    fn test_read_all_is_ordered_and_tagged() {
        let store = MemoryStore::new();
        apply_payload(&store, 3, QUEUE, "WRITE 2 b");
        apply_payload(&store, 3, QUEUE, "WRITE 1 a");

        let reply = apply_payload(&store, 3, QUEUE, "READ ALL");
        assert_eq!(reply.replica_id, 3);
        let lines = reply.lines.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_number, 1);
        assert_eq!(lines[1].line_number, 2);
    }

    #[test]
    fn test_status_reports_queue_and_count() {
        let store = MemoryStore::new();
        apply_payload(&store, 4, QUEUE, "WRITE 1 x");

        let reply = apply_payload(&store, 4, QUEUE, "STATUS");
        assert_eq!(reply.status.as_deref(), Some("online"));
        assert_eq!(reply.queue_name.as_deref(), Some(QUEUE));
        assert_eq!(reply.line_count, Some(1));
        assert!(reply.timestamp.is_some());
    }

    #[test]
    fn test_unknown_command_echoes_raw_input() {
        let store = MemoryStore::new();
        let reply = apply_payload(&store, 5, QUEUE, "PURGE EVERYTHING");
        assert_eq!(reply.error.as_deref(), Some("Unknown command"));
        assert_eq!(reply.received_message.as_deref(), Some("PURGE EVERYTHING"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_structured_write_payload() {
        let store = MemoryStore::new();
        let reply = apply_payload(&store, 6, QUEUE, r#"{"line_number": 8, "content": "via json"}"#);
        assert_eq!(reply.status.as_deref(), Some("success"));
        assert_eq!(store.most_recent().unwrap().unwrap().content, "via json");
    }
}
