//! Broker TCP server
//!
//! Accept loop plus per-connection tasks: a reader that applies client
//! frames serially (preserving the one-response-per-frame contract), a
//! writer that serializes outgoing frames, and per-consumer pump/forward
//! tasks that drain queue buffers through a bounded prefetch channel.
//!
//! With implicit acknowledgment, a delivery counts as acknowledged once
//! forwarded; the prefetch bound therefore limits the pump -> forward hop,
//! not unacknowledged deliveries at the client. The connection's write
//! channel stays unbounded because control responses share it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use super::exchange::{BrokerState, ConnId, Popped};
use crate::observability::Logger;
use crate::wire::{BrokerFrame, ClientFrame, Delivery};

type Shared = Arc<Mutex<BrokerState>>;

/// The embedded broker. Bind, then `run` the accept loop.
pub struct Broker {
    listener: TcpListener,
    state: Shared,
}

impl Broker {
    /// Bind the listener. Use port 0 for an ephemeral port in tests.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(BrokerState::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the process exits. Each connection is an
    /// independent task; one misbehaving client never affects another.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.local_addr()?.to_string();
        Logger::info("broker_listening", &[("addr", &addr)]);

        let mut next_conn: ConnId = 0;
        loop {
            let (stream, peer) = self.listener.accept().await?;
            next_conn += 1;
            let conn = next_conn;
            let state = Arc::clone(&self.state);
            Logger::info(
                "broker_connection_open",
                &[("conn", &conn.to_string()), ("peer", &peer.to_string())],
            );
            tokio::spawn(async move {
                handle_connection(state, stream, conn).await;
            });
        }
    }
}

/// Run a closure against the broker state. Returns `None` only if the state
/// mutex is poisoned, which is treated as an internal broker error.
fn with_state<T>(state: &Shared, f: impl FnOnce(&mut BrokerState) -> T) -> Option<T> {
    match state.lock() {
        Ok(mut guard) => Some(f(&mut guard)),
        Err(_) => None,
    }
}

fn internal_error() -> BrokerFrame {
    BrokerFrame::Error {
        message: "internal broker error".to_string(),
    }
}

async fn handle_connection(state: Shared, stream: TcpStream, conn: ConnId) {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<BrokerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ClientFrame>(&line) {
            Ok(frame) => apply_frame(&state, conn, frame, &out_tx),
            Err(e) => BrokerFrame::Error {
                message: format!("malformed frame: {}", e),
            },
        };
        if out_tx.send(response).is_err() {
            break;
        }
    }

    if let Some(wakeups) = with_state(&state, |s| s.detach_connection(conn)) {
        for wakeup in wakeups {
            wakeup.notify_one();
        }
    }
    drop(out_tx);
    let _ = writer.await;
    Logger::info("broker_connection_closed", &[("conn", &conn.to_string())]);
}

/// Apply one client frame and produce its control response. Consumer
/// attachment spawns the pump and forward tasks as a side effect.
fn apply_frame(
    state: &Shared,
    conn: ConnId,
    frame: ClientFrame,
    out_tx: &mpsc::UnboundedSender<BrokerFrame>,
) -> BrokerFrame {
    match frame {
        ClientFrame::DeclareExchange { exchange } => {
            match with_state(state, |s| s.declare_exchange(&exchange)) {
                Some(()) => BrokerFrame::Ok,
                None => internal_error(),
            }
        }

        ClientFrame::DeclareQueue {
            name,
            durable,
            exclusive,
            auto_delete,
        } => match with_state(state, |s| {
            s.declare_queue(conn, name, durable, exclusive, auto_delete)
        }) {
            Some(Ok(name)) => BrokerFrame::QueueDeclared { name },
            Some(Err(e)) => BrokerFrame::Error {
                message: e.to_string(),
            },
            None => internal_error(),
        },

        ClientFrame::BindQueue { queue, exchange } => {
            match with_state(state, |s| s.bind(&queue, &exchange)) {
                Some(Ok(())) => BrokerFrame::Ok,
                Some(Err(e)) => BrokerFrame::Error {
                    message: e.to_string(),
                },
                None => internal_error(),
            }
        }

        ClientFrame::Publish {
            exchange,
            routing_key,
            properties,
            payload,
        } => {
            let delivery = Delivery {
                queue: String::new(),
                properties,
                payload,
            };
            match with_state(state, |s| s.publish(&exchange, &routing_key, delivery)) {
                Some(Ok((wakeups, routed))) => {
                    if routed == 0 {
                        Logger::warn(
                            "broker_unroutable",
                            &[("exchange", &exchange), ("routing_key", &routing_key)],
                        );
                    }
                    // Wakeups fire outside the state lock.
                    for wakeup in wakeups {
                        wakeup.notify_one();
                    }
                    BrokerFrame::Ok
                }
                Some(Err(e)) => BrokerFrame::Error {
                    message: e.to_string(),
                },
                None => internal_error(),
            }
        }

        ClientFrame::Consume { queue, prefetch } => {
            let (tx, rx) = mpsc::channel::<Delivery>(prefetch.max(1));
            match with_state(state, |s| s.attach_consumer(conn, &queue)) {
                Some(Ok((consumer_id, wakeup))) => {
                    tokio::spawn(pump(
                        Arc::clone(state),
                        queue.clone(),
                        consumer_id,
                        wakeup,
                        tx,
                    ));
                    tokio::spawn(forward(rx, out_tx.clone()));
                    BrokerFrame::Ok
                }
                Some(Err(e)) => BrokerFrame::Error {
                    message: e.to_string(),
                },
                None => internal_error(),
            }
        }
    }
}

/// Drain a queue's buffer into its consumer channel, in FIFO order. Exits
/// when the consumer is replaced, removed, or its channel closes.
async fn pump(
    state: Shared,
    queue: String,
    consumer_id: u64,
    wakeup: Arc<Notify>,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let notified = wakeup.notified();
        match with_state(&state, |s| s.pop_for(&queue, consumer_id)) {
            Some(Popped::Delivery(delivery)) => {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            Some(Popped::Empty) => notified.await,
            Some(Popped::Stale) | None => break,
        }
    }
}

/// Turn pumped deliveries into frames on the connection's write channel.
/// Past this point a delivery is out of the prefetch window.
async fn forward(mut rx: mpsc::Receiver<Delivery>, out_tx: mpsc::UnboundedSender<BrokerFrame>) {
    while let Some(delivery) = rx.recv().await {
        let frame = BrokerFrame::Delivery {
            queue: delivery.queue,
            properties: delivery.properties,
            payload: delivery.payload,
        };
        if out_tx.send(frame).is_err() {
            break;
        }
    }
}
