//! Reply routing and request/reply coordination
//!
//! The router owns the client's anonymous reply queue and demultiplexes
//! incoming replies by correlation ID. Unlike a complete-once future, the
//! router can feed any number of subscribers per correlation ID with every
//! reply that arrives — the read aggregator depends on that. The one-shot
//! coordinator is a thin layer on top for callers that only want the first
//! reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::connection::BrokerConnection;
use super::errors::MessagingResult;
use crate::observability::Logger;
use crate::wire::{Delivery, Properties};

/// correlation ID -> (token, sender) per interested subscriber.
type SubscriberMap = Arc<StdMutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>>>;

/// Hand a reply to every subscriber registered for its correlation ID.
/// Replies with no subscriber (late arrivals after a timeout, or stray
/// traffic) are dropped at this layer.
fn dispatch(subscribers: &SubscriberMap, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
        Logger::warn("reply_without_correlation_id", &[("queue", &delivery.queue)]);
        return;
    };
    let Ok(map) = subscribers.lock() else {
        return;
    };
    match map.get(&correlation_id) {
        Some(interested) => {
            for (_, tx) in interested {
                let _ = tx.send(delivery.clone());
            }
        }
        None => {
            Logger::info("late_reply_dropped", &[("correlation_id", &correlation_id)]);
        }
    }
}

struct RouterState {
    queue: Option<String>,
    generation: u64,
}

/// Demultiplexer for the per-process anonymous reply queue.
pub struct ReplyRouter {
    conn: Arc<BrokerConnection>,
    subscribers: SubscriberMap,
    state: Mutex<RouterState>,
    next_token: AtomicU64,
}

impl ReplyRouter {
    pub fn new(conn: Arc<BrokerConnection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            subscribers: Arc::default(),
            state: Mutex::new(RouterState {
                queue: None,
                generation: 0,
            }),
            next_token: AtomicU64::new(0),
        })
    }

    /// Name of the reply queue, declaring it (and its consumer) if this is
    /// the first use or the connection has been re-established since. The
    /// old anonymous queue dies with its connection, so a new generation
    /// always gets a fresh one.
    pub async fn ensure_reply_queue(&self) -> MessagingResult<String> {
        let mut state = self.state.lock().await;
        if let Some(queue) = &state.queue {
            if state.generation == self.conn.generation() {
                return Ok(queue.clone());
            }
        }

        let queue = self.conn.declare_reply_queue().await?;
        let rx = self
            .conn
            .consume_transient(&queue, self.conn.config().prefetch_count)
            .await?;
        // Read the generation after the round trips; they may themselves
        // have triggered a reconnect.
        state.generation = self.conn.generation();
        state.queue = Some(queue.clone());

        let subscribers = Arc::clone(&self.subscribers);
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(delivery) = rx.recv().await {
                dispatch(&subscribers, delivery);
            }
        });

        Logger::info("reply_queue_ready", &[("queue", &queue)]);
        Ok(queue)
    }

    /// Register interest in every reply carrying a correlation ID. The
    /// subscription unregisters itself on drop.
    pub fn subscribe(&self, correlation_id: &str) -> ReplySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.subscribers.lock() {
            map.entry(correlation_id.to_string())
                .or_default()
                .push((token, tx));
        }
        ReplySubscription {
            correlation_id: correlation_id.to_string(),
            token,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

/// A live interest in one correlation ID. Dropping it removes the pending
/// slot; replies arriving afterwards are invisible to this subscriber.
pub struct ReplySubscription {
    correlation_id: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<Delivery>,
    subscribers: SubscriberMap,
}

impl ReplySubscription {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Next reply for this correlation ID, or `None` if the router is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        if let Ok(mut map) = self.subscribers.lock() {
            if let Some(interested) = map.get_mut(&self.correlation_id) {
                interested.retain(|(token, _)| *token != self.token);
                if interested.is_empty() {
                    map.remove(&self.correlation_id);
                }
            }
        }
    }
}

/// One-shot request/reply: publish a broadcast with reply-to and correlation
/// ID set, resolve with the first reply or a no-answer sentinel on timeout.
pub struct RequestReplyCoordinator {
    conn: Arc<BrokerConnection>,
    router: Arc<ReplyRouter>,
}

impl RequestReplyCoordinator {
    pub fn new(conn: Arc<BrokerConnection>, router: Arc<ReplyRouter>) -> Self {
        Self { conn, router }
    }

    /// Broadcast a request and return the stream of replies keyed to its
    /// fresh correlation ID. Callers that need every reply (the read
    /// aggregator) consume this stream directly.
    pub async fn request_stream(&self, payload: &str) -> MessagingResult<ReplySubscription> {
        let reply_to = self.router.ensure_reply_queue().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let subscription = self.router.subscribe(&correlation_id);
        self.conn
            .publish_broadcast(
                payload,
                Properties {
                    reply_to: Some(reply_to),
                    correlation_id: Some(correlation_id),
                    persistent: true,
                },
            )
            .await?;
        Ok(subscription)
    }

    /// First reply wins; `None` is the no-answer sentinel after the timeout
    /// elapses. Later replies to the same correlation ID are dropped once
    /// the subscription is gone.
    pub async fn request_with_timeout(
        &self,
        payload: &str,
        wait: Duration,
    ) -> MessagingResult<Option<String>> {
        let mut subscription = self.request_stream(payload).await?;
        match tokio::time::timeout(wait, subscription.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery.payload)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}
