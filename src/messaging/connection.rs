//! Broker connection manager
//!
//! Owns one TCP connection to the broker. Connecting retries a bounded
//! number of times with a fixed delay; exhaustion is a fatal error for the
//! attempting call. A read-loop exit flips the connected flag (the shutdown
//! observer), and every operation goes through `ensure_connected`, which
//! re-dials, re-declares the exchange and re-attaches durable consumers
//! before anything proceeds on a stale channel.
//!
//! Concurrent publishers on one connection are serialized by the internal
//! mutex; every client frame is confirmed by exactly one control response.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep, timeout};

use super::errors::{MessagingError, MessagingResult};
use crate::config::Config;
use crate::observability::Logger;
use crate::wire::{BrokerFrame, ClientFrame, Delivery, Properties};

/// Control responses awaiting their frame, in send order.
type PendingControl = Arc<StdMutex<VecDeque<oneshot::Sender<BrokerFrame>>>>;

/// Queue name -> application consumer channel.
type ConsumerMap = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>>;

/// A consumer to re-attach after reconnect (durable queues only; anonymous
/// reply queues are rebuilt by their owner instead).
struct ConsumerSpec {
    queue: String,
    prefetch: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Live I/O for one established connection.
struct Active {
    frame_tx: mpsc::UnboundedSender<String>,
    pending: PendingControl,
    consumers: ConsumerMap,
    connected: watch::Receiver<bool>,
}

impl Active {
    fn is_open(&self) -> bool {
        *self.connected.borrow()
    }
}

#[derive(Default)]
struct Inner {
    active: Option<Active>,
    durable_consumers: Vec<ConsumerSpec>,
    closed: bool,
}

/// One broker connection, shared by handle across components.
pub struct BrokerConnection {
    cfg: Config,
    inner: Mutex<Inner>,
    /// Bumped on every successful (re)connect; lets reply-queue owners
    /// detect that their anonymous queue died with the old connection.
    generation: AtomicU64,
}

impl BrokerConnection {
    /// Connect with bounded retry and declare the fanout exchange.
    pub async fn connect(cfg: Config) -> MessagingResult<Arc<Self>> {
        let conn = Arc::new(Self {
            cfg,
            inner: Mutex::new(Inner::default()),
            generation: AtomicU64::new(0),
        });
        {
            let mut inner = conn.inner.lock().await;
            conn.establish(&mut inner).await?;
        }
        Ok(conn)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Connection generation; changes whenever a fresh TCP session is
    /// established.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // =========================================================================
    // Topology / publishing
    // =========================================================================

    /// Declare the durable queue for a replica ID and bind it to the fanout
    /// exchange. Returns the queue name.
    pub async fn declare_replica_queue(&self, replica_id: u32) -> MessagingResult<String> {
        let queue = self.cfg.replica_queue_name(replica_id);
        let declared = self
            .call(ClientFrame::DeclareQueue {
                name: Some(queue.clone()),
                durable: true,
                exclusive: false,
                auto_delete: false,
            })
            .await?;
        let name = expect_queue_declared(declared)?;
        expect_ok(
            self.call(ClientFrame::BindQueue {
                queue: name.clone(),
                exchange: self.cfg.exchange.clone(),
            })
            .await?,
        )?;
        Ok(name)
    }

    /// Declare an exclusive auto-delete anonymous queue for replies. The
    /// broker picks the name; the queue dies with this connection.
    pub async fn declare_reply_queue(&self) -> MessagingResult<String> {
        let declared = self
            .call(ClientFrame::DeclareQueue {
                name: None,
                durable: false,
                exclusive: true,
                auto_delete: true,
            })
            .await?;
        expect_queue_declared(declared)
    }

    /// Persistent publish to the fanout exchange; every currently-bound
    /// queue receives a copy.
    pub async fn publish_broadcast(
        &self,
        payload: &str,
        mut properties: Properties,
    ) -> MessagingResult<()> {
        properties.persistent = true;
        expect_ok(
            self.call(ClientFrame::Publish {
                exchange: self.cfg.exchange.clone(),
                routing_key: String::new(),
                properties,
                payload: payload.to_string(),
            })
            .await?,
        )
    }

    /// Point-to-point reply through the default exchange, addressed by
    /// queue name and tagged with the correlation ID for matching.
    pub async fn publish_direct(
        &self,
        queue: &str,
        payload: &str,
        correlation_id: Option<&str>,
    ) -> MessagingResult<()> {
        expect_ok(
            self.call(ClientFrame::Publish {
                exchange: String::new(),
                routing_key: queue.to_string(),
                properties: Properties {
                    reply_to: None,
                    correlation_id: correlation_id.map(str::to_string),
                    persistent: false,
                },
                payload: payload.to_string(),
            })
            .await?,
        )
    }

    /// Consume a durable queue. The consumer is re-attached automatically
    /// after a reconnect.
    pub async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> MessagingResult<mpsc::UnboundedReceiver<Delivery>> {
        self.consume_inner(queue, prefetch, true).await
    }

    /// Consume a transient (reply) queue. Not re-attached on reconnect; the
    /// owner is expected to declare a fresh queue instead.
    pub async fn consume_transient(
        &self,
        queue: &str,
        prefetch: usize,
    ) -> MessagingResult<mpsc::UnboundedReceiver<Delivery>> {
        self.consume_inner(queue, prefetch, false).await
    }

    async fn consume_inner(
        &self,
        queue: &str,
        prefetch: usize,
        durable: bool,
    ) -> MessagingResult<mpsc::UnboundedReceiver<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().await;
        self.ensure_active(&mut inner).await?;
        let Some(active) = inner.active.as_ref() else {
            return Err(MessagingError::Disconnected);
        };
        if let Ok(mut map) = active.consumers.lock() {
            map.insert(queue.to_string(), tx.clone());
        }
        let result = Self::call_on(
            active,
            &ClientFrame::Consume {
                queue: queue.to_string(),
                prefetch,
            },
            self.cfg.control_timeout,
        )
        .await
        .and_then(expect_ok);
        if let Err(e) = result {
            if matches!(e, MessagingError::Disconnected) {
                inner.active = None;
            }
            return Err(e);
        }

        if durable {
            inner.durable_consumers.push(ConsumerSpec {
                queue: queue.to_string(),
                prefetch,
                tx,
            });
        }
        Ok(rx)
    }

    /// Idempotent, best-effort close. Never fails; after closing, further
    /// operations report `Disconnected` instead of reconnecting.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.closed {
            inner.closed = true;
            inner.active = None;
            Logger::info("broker_connection_closed", &[("addr", &self.cfg.broker_addr)]);
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// One confirmed round trip: send a frame, await its control response.
    async fn call(&self, frame: ClientFrame) -> MessagingResult<BrokerFrame> {
        let mut inner = self.inner.lock().await;
        self.ensure_active(&mut inner).await?;
        let Some(active) = inner.active.as_ref() else {
            return Err(MessagingError::Disconnected);
        };
        let result = Self::call_on(active, &frame, self.cfg.control_timeout).await;
        if matches!(result, Err(MessagingError::Disconnected)) {
            // Fail this call; the next one reconnects.
            inner.active = None;
        }
        result
    }

    async fn call_on(
        active: &Active,
        frame: &ClientFrame,
        control_timeout: Duration,
    ) -> MessagingResult<BrokerFrame> {
        let (tx, rx) = oneshot::channel();
        match active.pending.lock() {
            Ok(mut pending) => pending.push_back(tx),
            Err(_) => return Err(MessagingError::Disconnected),
        }
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        if active.frame_tx.send(line).is_err() {
            return Err(MessagingError::Disconnected);
        }
        match timeout(control_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(MessagingError::Disconnected),
            Err(_) => Err(MessagingError::ControlTimeout(control_timeout)),
        }
    }

    /// Reconnect if the connection or channel is not open. No operation
    /// proceeds on a stale channel.
    async fn ensure_active(&self, inner: &mut Inner) -> MessagingResult<()> {
        if inner.closed {
            return Err(MessagingError::Disconnected);
        }
        if let Some(active) = &inner.active {
            if active.is_open() {
                return Ok(());
            }
            Logger::warn(
                "broker_connection_lost",
                &[("addr", &self.cfg.broker_addr)],
            );
            inner.active = None;
        }
        self.establish(inner).await
    }

    /// Dial with bounded retry; on success declare the exchange and
    /// re-attach durable consumers.
    async fn establish(&self, inner: &mut Inner) -> MessagingResult<()> {
        let attempts = self.cfg.connect_retry_count.max(1);
        let mut last_reason = String::from("no attempt made");

        for attempt in 1..=attempts {
            Logger::info(
                "broker_connect_attempt",
                &[
                    ("addr", &self.cfg.broker_addr),
                    ("attempt", &attempt.to_string()),
                ],
            );
            match TcpStream::connect(&self.cfg.broker_addr).await {
                Ok(stream) => match self.initialize(stream, inner).await {
                    Ok(active) => {
                        inner.active = Some(active);
                        self.generation.fetch_add(1, Ordering::AcqRel);
                        Logger::info("broker_connected", &[("addr", &self.cfg.broker_addr)]);
                        return Ok(());
                    }
                    Err(e) => last_reason = e.to_string(),
                },
                Err(e) => last_reason = e.to_string(),
            }
            if attempt < attempts {
                sleep(self.cfg.connect_retry_delay).await;
            }
        }

        Logger::error(
            "broker_connect_failed",
            &[
                ("addr", &self.cfg.broker_addr),
                ("attempts", &attempts.to_string()),
                ("reason", &last_reason),
            ],
        );
        Err(MessagingError::ConnectionExhausted {
            addr: self.cfg.broker_addr.clone(),
            attempts,
            reason: last_reason,
        })
    }

    /// Set up I/O tasks on a fresh stream, declare the exchange and
    /// re-attach durable consumers.
    async fn initialize(&self, stream: TcpStream, inner: &mut Inner) -> MessagingResult<Active> {
        let active = spawn_io(stream);

        expect_ok(
            Self::call_on(
                &active,
                &ClientFrame::DeclareExchange {
                    exchange: self.cfg.exchange.clone(),
                },
                self.cfg.control_timeout,
            )
            .await?,
        )?;

        // Drop consumers whose application side is gone, then re-attach the
        // rest so deliveries resume where the old connection left off.
        inner.durable_consumers.retain(|spec| !spec.tx.is_closed());
        if let Ok(mut map) = active.consumers.lock() {
            for spec in &inner.durable_consumers {
                map.insert(spec.queue.clone(), spec.tx.clone());
            }
        }
        for spec in &inner.durable_consumers {
            let result = Self::call_on(
                &active,
                &ClientFrame::Consume {
                    queue: spec.queue.clone(),
                    prefetch: spec.prefetch,
                },
                self.cfg.control_timeout,
            )
            .await
            .and_then(expect_ok);
            if let Err(e) = result {
                Logger::error(
                    "consumer_reattach_failed",
                    &[("queue", &spec.queue), ("reason", &e.to_string())],
                );
            }
        }
        Ok(active)
    }
}

/// Spawn the reader and writer tasks for one TCP session.
fn spawn_io(stream: TcpStream) -> Active {
    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let (connected_tx, connected_rx) = watch::channel(true);
    let pending: PendingControl = Arc::default();
    let consumers: ConsumerMap = Arc::default();

    tokio::spawn(async move {
        while let Some(line) = frame_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let reader_pending = Arc::clone(&pending);
    let reader_consumers = Arc::clone(&consumers);
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BrokerFrame>(&line) {
                Ok(BrokerFrame::Delivery {
                    queue,
                    properties,
                    payload,
                }) => {
                    let target = reader_consumers
                        .lock()
                        .ok()
                        .and_then(|map| map.get(&queue).cloned());
                    match target {
                        Some(tx) => {
                            let _ = tx.send(Delivery {
                                queue,
                                properties,
                                payload,
                            });
                        }
                        None => Logger::warn("delivery_without_consumer", &[("queue", &queue)]),
                    }
                }
                Ok(control) => {
                    let waiter = reader_pending.lock().ok().and_then(|mut p| p.pop_front());
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(control);
                        }
                        None => Logger::warn("unexpected_control_frame", &[]),
                    }
                }
                Err(e) => {
                    Logger::warn("unparseable_broker_frame", &[("reason", &e.to_string())]);
                }
            }
        }
        // Shutdown observer: flip state so ensure_connected reconnects.
        let _ = connected_tx.send(false);
    });

    Active {
        frame_tx,
        pending,
        consumers,
        connected: connected_rx,
    }
}

fn expect_ok(frame: BrokerFrame) -> MessagingResult<()> {
    match frame {
        BrokerFrame::Ok => Ok(()),
        BrokerFrame::Error { message } => Err(MessagingError::Broker(message)),
        other => Err(MessagingError::Protocol(format!("{:?}", other))),
    }
}

fn expect_queue_declared(frame: BrokerFrame) -> MessagingResult<String> {
    match frame {
        BrokerFrame::QueueDeclared { name } => Ok(name),
        BrokerFrame::Error { message } => Err(MessagingError::Broker(message)),
        other => Err(MessagingError::Protocol(format!("{:?}", other))),
    }
}
