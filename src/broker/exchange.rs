//! Broker state: exchanges, queues, bindings, consumers
//!
//! All state lives behind one lock; critical sections never await. Delivery
//! ordering per queue is the buffer's FIFO order, which matches publish
//! order for that queue. No cross-queue ordering exists.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::wire::Delivery;

/// Identifies one client connection for ownership tracking.
pub type ConnId = u64;

/// Broker-side failures reported back to the offending client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("queue {0} is exclusive to another connection")]
    ExclusiveConflict(String),
}

/// A consumer attached to a queue. The delivery channel itself lives with
/// the pump task; the state only tracks identity and the wakeup handle.
struct Consumer {
    id: u64,
    conn: ConnId,
    wakeup: Arc<Notify>,
}

struct Queue {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: Option<ConnId>,
    buffer: VecDeque<Delivery>,
    consumer: Option<Consumer>,
}

/// Result of a pump's attempt to take the next delivery for its consumer.
pub enum Popped {
    /// Next delivery in FIFO order.
    Delivery(Delivery),
    /// Buffer currently empty; wait for a wakeup.
    Empty,
    /// The consumer was replaced or removed; the pump must exit.
    Stale,
}

/// Everything the broker knows, guarded by a single mutex in the server.
#[derive(Default)]
pub struct BrokerState {
    exchanges: HashSet<String>,
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, Queue>,
    next_consumer_id: u64,
}

impl BrokerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a fanout exchange. Idempotent.
    pub fn declare_exchange(&mut self, name: &str) {
        self.exchanges.insert(name.to_string());
        self.bindings.entry(name.to_string()).or_default();
    }

    /// Declare a queue, generating an anonymous name when none is given.
    /// Redeclaring an existing queue is idempotent, except that an exclusive
    /// queue belongs to the connection that created it.
    pub fn declare_queue(
        &mut self,
        conn: ConnId,
        name: Option<String>,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    ) -> Result<String, BrokerError> {
        let name = name.unwrap_or_else(|| format!("reply.{}", Uuid::new_v4()));

        if let Some(existing) = self.queues.get(&name) {
            if existing.exclusive && existing.owner != Some(conn) {
                return Err(BrokerError::ExclusiveConflict(name));
            }
            return Ok(name);
        }

        self.queues.insert(
            name.clone(),
            Queue {
                durable,
                exclusive,
                auto_delete,
                owner: exclusive.then_some(conn),
                buffer: VecDeque::new(),
                consumer: None,
            },
        );
        Ok(name)
    }

    /// Bind a queue to an exchange. Fanout ignores routing keys, so a
    /// binding is just exchange -> queue membership.
    pub fn bind(&mut self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let bound = self
            .bindings
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        bound.insert(queue.to_string());
        Ok(())
    }

    /// Route a publish. An empty exchange name addresses the queue named by
    /// the routing key directly; a missing target there is dropped, not an
    /// error, because reply queues legitimately vanish when clients close.
    ///
    /// Returns the wakeups to fire (after the lock is released) and the
    /// number of queues that received the message.
    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        delivery: Delivery,
    ) -> Result<(Vec<Arc<Notify>>, usize), BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let bound = self
                .bindings
                .get(exchange)
                .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
            let mut names: Vec<String> = bound.iter().cloned().collect();
            names.sort();
            names
        };

        let mut wakeups = Vec::new();
        let routed = targets.len();
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                let mut copy = delivery.clone();
                copy.queue = name.clone();
                queue.buffer.push_back(copy);
                if let Some(consumer) = &queue.consumer {
                    wakeups.push(Arc::clone(&consumer.wakeup));
                }
            }
        }
        Ok((wakeups, routed))
    }

    /// Attach a consumer, replacing any previous one (reconnect support).
    /// Returns the consumer id and its wakeup handle for the pump task. A
    /// displaced consumer's pump is woken so it can observe staleness and
    /// exit.
    pub fn attach_consumer(
        &mut self,
        conn: ConnId,
        queue: &str,
    ) -> Result<(u64, Arc<Notify>), BrokerError> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        if q.exclusive && q.owner != Some(conn) {
            return Err(BrokerError::ExclusiveConflict(queue.to_string()));
        }

        self.next_consumer_id += 1;
        let id = self.next_consumer_id;
        let wakeup = Arc::new(Notify::new());
        if let Some(old) = q.consumer.replace(Consumer {
            id,
            conn,
            wakeup: Arc::clone(&wakeup),
        }) {
            old.wakeup.notify_one();
        }
        Ok((id, wakeup))
    }

    /// Pop the next delivery for a specific consumer attachment.
    pub fn pop_for(&mut self, queue: &str, consumer_id: u64) -> Popped {
        let Some(q) = self.queues.get_mut(queue) else {
            return Popped::Stale;
        };
        match &q.consumer {
            Some(c) if c.id == consumer_id => {}
            _ => return Popped::Stale,
        }
        match q.buffer.pop_front() {
            Some(delivery) => Popped::Delivery(delivery),
            None => Popped::Empty,
        }
    }

    /// Tear down everything a dropped connection owned: its consumer
    /// attachments, and its exclusive / auto-delete queues (buffered
    /// messages in those queues are discarded with them). Returns the
    /// wakeups of removed consumers so their pumps can exit.
    pub fn detach_connection(&mut self, conn: ConnId) -> Vec<Arc<Notify>> {
        let mut wakeups = Vec::new();
        for queue in self.queues.values_mut() {
            if matches!(&queue.consumer, Some(c) if c.conn == conn) {
                if let Some(old) = queue.consumer.take() {
                    wakeups.push(old.wakeup);
                }
            }
        }

        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(conn) && (q.exclusive || q.auto_delete || !q.durable))
            .map(|(name, _)| name.clone())
            .collect();
        for name in doomed {
            if let Some(queue) = self.queues.remove(&name) {
                if let Some(consumer) = queue.consumer {
                    wakeups.push(consumer.wakeup);
                }
            }
            for bound in self.bindings.values_mut() {
                bound.remove(&name);
            }
        }
        wakeups
    }

    /// Buffered depth of a queue, for diagnostics.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.buffer.len())
    }
}
