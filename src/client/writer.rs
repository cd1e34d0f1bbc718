//! Write client
//!
//! Writes are fire-and-forget broadcasts: the fanout exchange copies each
//! WRITE to every bound replica queue, and durable queues hold it for
//! replicas that are down.

use std::sync::Arc;

use crate::messaging::{BrokerConnection, MessagingResult};
use crate::observability::Logger;
use crate::wire::{Command, Properties};

/// Broadcast writer.
pub struct LineWriter {
    conn: Arc<BrokerConnection>,
}

impl LineWriter {
    pub fn new(conn: Arc<BrokerConnection>) -> Self {
        Self { conn }
    }

    /// Broadcast `WRITE <line_number> <content>` to all replicas.
    pub async fn write_line(&self, line_number: i64, content: &str) -> MessagingResult<()> {
        let payload = Command::Write {
            line_number,
            content: content.to_string(),
        }
        .encode();
        self.conn
            .publish_broadcast(&payload, Properties::default())
            .await?;
        Logger::info(
            "write_published",
            &[("line", &line_number.to_string()), ("content", content)],
        );
        Ok(())
    }

    /// Broadcast a `READ ALL` without waiting for replies; each replica
    /// processes and logs it without replying.
    pub async fn broadcast_read_all(&self) -> MessagingResult<()> {
        self.conn
            .publish_broadcast(&Command::ReadAll.encode(), Properties::default())
            .await?;
        Logger::info("read_all_broadcast", &[]);
        Ok(())
    }
}
