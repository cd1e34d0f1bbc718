//! Wire-level protocol types
//!
//! Two layers share this module:
//! - the application envelope: bare command strings (`WRITE <n> <content>`,
//!   `READ LAST`, ...) or a structured JSON object implying a WRITE, and the
//!   JSON reply objects replicas send back;
//! - the broker framing: newline-delimited JSON frames exchanged between a
//!   client connection and the broker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::LineRecord;

/// Current wall-clock time as epoch milliseconds.
///
/// All replication timestamps use this clock; last-writer-wins resolution
/// is only as good as clock synchronization across replicas.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Commands
// =============================================================================

/// Literal command tokens.
pub const TOKEN_WRITE_PREFIX: &str = "WRITE ";
pub const TOKEN_READ_LAST: &str = "READ LAST";
pub const TOKEN_READ_ALL: &str = "READ ALL";
pub const TOKEN_STATUS: &str = "STATUS";
pub const TOKEN_HEARTBEAT: &str = "HEARTBEAT";

/// A command addressed to every replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Append a line. Content is the remainder after the second space and
    /// may itself contain spaces.
    Write { line_number: i64, content: String },
    /// Reply with the most recent line.
    ReadLast,
    /// Reply with all lines ordered by line number.
    ReadAll,
    /// Reply with liveness info.
    Status,
    /// Reply with liveness info (alias used by periodic probes).
    Heartbeat,
}

/// Structured alternative to the bare `WRITE` string.
#[derive(Debug, Deserialize)]
struct StructuredWrite {
    line_number: i64,
    content: String,
}

/// Command parse failures. `Format` means the payload was recognizably a
/// WRITE but malformed; `Unknown` means the input matched nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid WRITE payload: {0}")]
    Format(String),
    #[error("unknown command: {0}")]
    Unknown(String),
}

impl Command {
    /// Parse an envelope payload.
    ///
    /// A JSON object `{line_number, content}` is an implicit WRITE; anything
    /// else is matched against the literal command tokens.
    pub fn parse(payload: &str) -> Result<Command, CommandError> {
        if let Ok(write) = serde_json::from_str::<StructuredWrite>(payload) {
            return Ok(Command::Write {
                line_number: write.line_number,
                content: write.content,
            });
        }

        if let Some(rest) = payload.strip_prefix(TOKEN_WRITE_PREFIX) {
            let mut parts = rest.splitn(2, ' ');
            let number = parts.next().unwrap_or_default();
            let line_number: i64 = number
                .parse()
                .map_err(|_| CommandError::Format(payload.to_string()))?;
            let content = parts
                .next()
                .ok_or_else(|| CommandError::Format(payload.to_string()))?;
            return Ok(Command::Write {
                line_number,
                content: content.to_string(),
            });
        }

        match payload {
            TOKEN_READ_LAST => Ok(Command::ReadLast),
            TOKEN_READ_ALL => Ok(Command::ReadAll),
            TOKEN_STATUS => Ok(Command::Status),
            TOKEN_HEARTBEAT => Ok(Command::Heartbeat),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Render the bare command string for publishing.
    pub fn encode(&self) -> String {
        match self {
            Command::Write {
                line_number,
                content,
            } => format!("{}{} {}", TOKEN_WRITE_PREFIX, line_number, content),
            Command::ReadLast => TOKEN_READ_LAST.to_string(),
            Command::ReadAll => TOKEN_READ_ALL.to_string(),
            Command::Status => TOKEN_STATUS.to_string(),
            Command::Heartbeat => TOKEN_HEARTBEAT.to_string(),
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// One line inside a `READ ALL` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyLine {
    pub line_number: i64,
    pub content: String,
    pub timestamp: i64,
}

impl From<&LineRecord> for ReplyLine {
    fn from(record: &LineRecord) -> Self {
        Self {
            line_number: record.line_number,
            content: record.content.clone(),
            timestamp: record.written_at,
        }
    }
}

/// Reply object a replica sends for an incoming command.
///
/// This is the superset shape; every constructor fills only the fields that
/// apply and the rest are omitted from the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaReply {
    pub replica_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<ReplyLine>>,
}

impl ReplicaReply {
    /// Acknowledgement for a successful WRITE.
    pub fn write_success(replica_id: u32, line_number: i64) -> Self {
        Self {
            replica_id,
            status: Some("success".to_string()),
            line_number: Some(line_number),
            ..Default::default()
        }
    }

    /// `READ LAST` reply when the store has data.
    pub fn last_line(replica_id: u32, record: &LineRecord) -> Self {
        Self {
            replica_id,
            line_number: Some(record.line_number),
            content: Some(record.content.clone()),
            timestamp: Some(record.written_at),
            ..Default::default()
        }
    }

    /// `READ LAST` reply for an empty store. Counts as a successful
    /// no-data vote during aggregation.
    pub fn empty(replica_id: u32) -> Self {
        Self {
            replica_id,
            empty: Some(true),
            ..Default::default()
        }
    }

    /// `READ ALL` reply carrying the full listing.
    pub fn all_lines(replica_id: u32, records: &[LineRecord]) -> Self {
        Self {
            replica_id,
            lines: Some(records.iter().map(ReplyLine::from).collect()),
            ..Default::default()
        }
    }

    /// `STATUS`/`HEARTBEAT` liveness reply.
    pub fn status(replica_id: u32, queue_name: &str, line_count: usize, timestamp: i64) -> Self {
        Self {
            replica_id,
            status: Some("online".to_string()),
            queue_name: Some(queue_name.to_string()),
            line_count: Some(line_count),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    /// Error reply for a failed or malformed command.
    pub fn failure(replica_id: u32, error: impl Into<String>) -> Self {
        Self {
            replica_id,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Error reply for an unrecognized command, echoing the raw input.
    pub fn unknown(replica_id: u32, raw: &str) -> Self {
        Self {
            replica_id,
            error: Some("Unknown command".to_string()),
            received_message: Some(raw.to_string()),
            ..Default::default()
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> String {
        // A struct of scalars and strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// =============================================================================
// Broker framing
// =============================================================================

/// Message properties carried alongside a payload, mirroring the AMQP basic
/// properties the protocol relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

/// Frames a client sends to the broker. Each produces exactly one control
/// response, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Declare the durable fanout exchange. Idempotent.
    DeclareExchange { exchange: String },
    /// Declare a queue. `name: None` asks the broker to generate a fresh
    /// anonymous name (used for exclusive reply queues).
    DeclareQueue {
        #[serde(default)]
        name: Option<String>,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    },
    /// Bind a queue to a fanout exchange (routing key irrelevant).
    BindQueue { queue: String, exchange: String },
    /// Publish a payload. Empty exchange name addresses a queue directly by
    /// routing key (default-exchange semantics).
    Publish {
        exchange: String,
        routing_key: String,
        #[serde(default)]
        properties: Properties,
        payload: String,
    },
    /// Attach this connection as the consumer of a queue.
    Consume { queue: String, prefetch: usize },
}

/// Frames the broker sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Control acknowledgement.
    Ok,
    /// Control acknowledgement for `DeclareQueue`, carrying the queue name.
    QueueDeclared { name: String },
    /// A message delivered to a queue this connection consumes.
    Delivery {
        queue: String,
        #[serde(default)]
        properties: Properties,
        payload: String,
    },
    /// Control failure.
    Error { message: String },
}

/// A delivery as handed to application consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub properties: Properties,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_with_spaces_in_content() {
        let cmd = Command::parse("WRITE 7 hello brave new world").unwrap();
        assert_eq!(
            cmd,
            Command::Write {
                line_number: 7,
                content: "hello brave new world".to_string()
            }
        );
    }

    #[test]
    fn test_parse_write_missing_content_is_format_error() {
        assert!(matches!(
            Command::parse("WRITE abc"),
            Err(CommandError::Format(_))
        ));
        assert!(matches!(
            Command::parse("WRITE 3"),
            Err(CommandError::Format(_))
        ));
    }

    #[test]
    fn test_parse_read_tokens() {
        assert_eq!(Command::parse("READ LAST").unwrap(), Command::ReadLast);
        assert_eq!(Command::parse("READ ALL").unwrap(), Command::ReadAll);
        assert_eq!(Command::parse("STATUS").unwrap(), Command::Status);
        assert_eq!(Command::parse("HEARTBEAT").unwrap(), Command::Heartbeat);
    }

    #[test]
    fn test_parse_structured_write() {
        let cmd = Command::parse(r#"{"line_number": 4, "content": "json write"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Write {
                line_number: 4,
                content: "json write".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            Command::parse("DELETE 4"),
            Err(CommandError::Unknown("DELETE 4".to_string()))
        );
        // Bare WRITE without trailing space is not a WRITE.
        assert!(matches!(
            Command::parse("WRITE"),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn test_encode_round_trips() {
        let cmd = Command::Write {
            line_number: 1,
            content: "Hello".to_string(),
        };
        assert_eq!(cmd.encode(), "WRITE 1 Hello");
        assert_eq!(Command::parse(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn test_reply_wire_fields_are_camel_case() {
        let reply = ReplicaReply::write_success(3, 9);
        let json: serde_json::Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(json["replicaId"], 3);
        assert_eq!(json["status"], "success");
        assert_eq!(json["lineNumber"], 9);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_unknown_reply_echoes_input() {
        let reply = ReplicaReply::unknown(1, "FROB 12");
        let json: serde_json::Value = serde_json::from_str(&reply.encode()).unwrap();
        assert_eq!(json["error"], "Unknown command");
        assert_eq!(json["receivedMessage"], "FROB 12");
    }
}
