//! Read aggregation (client-side quorum read)
//!
//! A read broadcasts `READ LAST` with reply-to and correlation ID set, then
//! collects replies from the router's demux within a bounded window,
//! polling at a short interval and exiting early once the expected number
//! of replicas has answered. Conflicts resolve last-writer-wins by
//! timestamp: strictly greater replaces, ties keep the earlier-seen answer.
//!
//! Resolution is pure wall-clock comparison; it is only as correct as the
//! replicas' clock synchronization.

use std::sync::Arc;

use tokio::time::{timeout, Instant};

use crate::config::Config;
use crate::messaging::{
    BrokerConnection, MessagingResult, ReplyRouter, ReplySubscription, RequestReplyCoordinator,
};
use crate::observability::Logger;
use crate::wire::{Command, ReplicaReply};

/// The answer a read resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLine {
    pub replica_id: u32,
    pub line_number: i64,
    pub content: String,
    pub timestamp: i64,
}

/// Pure reply classifier and freshest-wins accumulator.
///
/// Every reply is one vote: `error` present counts as an error; `empty`
/// counts as a successful no-data vote; anything else is a successful data
/// vote and competes on timestamp.
#[derive(Debug, Default)]
pub struct ReadTally {
    pub success_count: usize,
    pub error_count: usize,
    best: Option<ResolvedLine>,
}

impl ReadTally {
    pub fn observe(&mut self, reply: &ReplicaReply) {
        if reply.error.is_some() {
            self.error_count += 1;
            return;
        }
        self.success_count += 1;
        if reply.empty == Some(true) {
            return;
        }
        let (Some(line_number), Some(content), Some(timestamp)) =
            (reply.line_number, reply.content.as_ref(), reply.timestamp)
        else {
            // A data vote missing required fields cannot compete.
            return;
        };
        let fresher = self
            .best
            .as_ref()
            .map_or(true, |best| timestamp > best.timestamp);
        if fresher {
            self.best = Some(ResolvedLine {
                replica_id: reply.replica_id,
                line_number,
                content: content.clone(),
                timestamp,
            });
        }
    }

    /// Replies seen so far, successes and errors combined.
    pub fn total(&self) -> usize {
        self.success_count + self.error_count
    }

    pub fn into_outcome(self) -> ReadOutcome {
        ReadOutcome {
            resolved: self.best,
            success_count: self.success_count,
            error_count: self.error_count,
        }
    }
}

/// What a bounded read reports: the freshest answer (if any) plus the vote
/// counts. Never an error just because replicas were silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub resolved: Option<ResolvedLine>,
    pub success_count: usize,
    pub error_count: usize,
}

impl ReadOutcome {
    /// Human-readable summary for one-shot clients.
    pub fn summary(&self) -> String {
        match &self.resolved {
            Some(line) => format!(
                "Most recent line (from replica {}): line {}: {} ({} success, {} error)",
                line.replica_id,
                line.line_number,
                line.content,
                self.success_count,
                self.error_count
            ),
            None if self.error_count > 0 => format!(
                "No valid responses; {} replica(s) reported errors",
                self.error_count
            ),
            None if self.success_count > 0 => format!(
                "No data on any replica ({} empty response(s))",
                self.success_count
            ),
            None => "No responses received from any replica".to_string(),
        }
    }
}

/// Client-side read aggregator.
pub struct ReadAggregator {
    coordinator: RequestReplyCoordinator,
    cfg: Config,
}

impl ReadAggregator {
    pub fn new(conn: Arc<BrokerConnection>, router: Arc<ReplyRouter>) -> Self {
        let cfg = conn.config().clone();
        Self {
            coordinator: RequestReplyCoordinator::new(conn, router),
            cfg,
        }
    }

    /// Broadcast `READ LAST` and resolve the freshest reply within the
    /// response window.
    pub async fn read_last(&self) -> MessagingResult<ReadOutcome> {
        let subscription = self.coordinator.request_stream(&Command::ReadLast.encode()).await?;
        let mut tally = ReadTally::default();
        self.collect(subscription, |delivery_payload| {
            match serde_json::from_str::<ReplicaReply>(delivery_payload) {
                Ok(reply) => tally.observe(&reply),
                Err(e) => {
                    Logger::warn("unparseable_reply", &[("reason", &e.to_string())]);
                    tally.error_count += 1;
                }
            }
            tally.total()
        })
        .await;
        Ok(tally.into_outcome())
    }

    /// Broadcast `READ ALL` and collect each replica's full listing within
    /// the response window.
    pub async fn read_all(&self) -> MessagingResult<Vec<ReplicaReply>> {
        let subscription = self.coordinator.request_stream(&Command::ReadAll.encode()).await?;
        let mut replies = Vec::new();
        self.collect(subscription, |payload| {
            match serde_json::from_str::<ReplicaReply>(payload) {
                Ok(reply) => replies.push(reply),
                Err(e) => Logger::warn("unparseable_reply", &[("reason", &e.to_string())]),
            }
            replies.len()
        })
        .await;
        Ok(replies)
    }

    /// Status probe through the one-shot coordinator: first replica to
    /// answer wins, `None` after the window closes.
    pub async fn status_probe(&self) -> MessagingResult<Option<ReplicaReply>> {
        let payload = self
            .coordinator
            .request_with_timeout(&Command::Status.encode(), self.cfg.response_timeout)
            .await?;
        Ok(payload.and_then(|p| parse_status(&p)))
    }

    /// Poll the reply stream until the window elapses or `seen` (returned
    /// by the observer) reaches the expected-replica threshold.
    async fn collect<F>(&self, mut subscription: ReplySubscription, mut observe: F)
    where
        F: FnMut(&str) -> usize,
    {
        let deadline = Instant::now() + self.cfg.response_timeout;
        let mut seen = 0;
        while seen < self.cfg.expected_replicas {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.cfg.response_poll_interval.min(deadline - now);
            match timeout(wait, subscription.recv()).await {
                Ok(Some(delivery)) => seen = observe(&delivery.payload),
                Ok(None) => break,
                // Poll tick elapsed without a reply; keep waiting until the
                // global deadline.
                Err(_) => {}
            }
        }
    }
}

/// Decode a status reply. Unparseable payloads are logged and discarded so
/// a garbled answer reads as no answer rather than a protocol failure.
fn parse_status(payload: &str) -> Option<ReplicaReply> {
    match serde_json::from_str(payload) {
        Ok(reply) => Some(reply),
        Err(e) => {
            Logger::warn("unparseable_reply", &[("reason", &e.to_string())]);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_vote(replica_id: u32, timestamp: i64, content: &str) -> ReplicaReply {
        ReplicaReply {
            replica_id,
            line_number: Some(1),
            content: Some(content.to_string()),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    #[test]
    fn test_freshest_timestamp_wins_regardless_of_arrival_order() {
        let orders: [[i64; 3]; 3] = [[100, 300, 200], [300, 100, 200], [200, 300, 100]];
        for order in orders {
            let mut tally = ReadTally::default();
            for t in order {
                tally.observe(&data_vote(t as u32, t, &format!("payload-{}", t)));
            }
            let outcome = tally.into_outcome();
            assert_eq!(outcome.success_count, 3);
            assert_eq!(outcome.error_count, 0);
            assert_eq!(outcome.resolved.unwrap().timestamp, 300);
        }
    }

    #[test]
    fn test_timestamp_tie_keeps_earlier_seen_answer() {
        let mut tally = ReadTally::default();
        tally.observe(&data_vote(1, 500, "first-seen"));
        tally.observe(&data_vote(2, 500, "second-seen"));

        let resolved = tally.into_outcome().resolved.unwrap();
        assert_eq!(resolved.replica_id, 1);
        assert_eq!(resolved.content, "first-seen");
    }

    #[test]
    fn test_empty_replies_are_no_data_success_votes() {
        let mut tally = ReadTally::default();
        tally.observe(&ReplicaReply::empty(1));
        tally.observe(&data_vote(2, 100, "x"));

        let outcome = tally.into_outcome();
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.resolved.unwrap().replica_id, 2);
    }

    #[test]
    fn test_error_replies_never_resolve() {
        let mut tally = ReadTally::default();
        tally.observe(&ReplicaReply::failure(1, "store down"));
        tally.observe(&ReplicaReply::failure(2, "store down"));

        let outcome = tally.into_outcome();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.error_count, 2);
        assert!(outcome.resolved.is_none());
        assert!(outcome.summary().contains("reported errors"));
    }

    #[test]
    fn test_zero_replies_is_a_clean_no_answer() {
        let outcome = ReadTally::default().into_outcome();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.error_count, 0);
        assert!(outcome.resolved.is_none());
        assert!(outcome.summary().contains("No responses"));
    }

    #[test]
    fn test_status_parse_discards_garbage() {
        assert!(parse_status("not json at all").is_none());
        let reply = parse_status(r#"{"replicaId": 4, "status": "online"}"#).unwrap();
        assert_eq!(reply.replica_id, 4);
        assert_eq!(reply.status.as_deref(), Some("online"));
    }

    #[test]
    fn test_data_vote_missing_fields_counts_but_cannot_win() {
        let mut tally = ReadTally::default();
        let mut partial = data_vote(1, 900, "broken");
        partial.timestamp = None;
        tally.observe(&partial);
        tally.observe(&data_vote(2, 100, "whole"));

        let outcome = tally.into_outcome();
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.resolved.unwrap().replica_id, 2);
    }
}
