//! End-to-End Replication Tests
//!
//! Full-stack tests against a live broker on an ephemeral port:
//! - broadcast WRITE fans out to every bound replica queue
//! - READ LAST aggregates replies and resolves by freshest timestamp
//! - silence is a clean no-answer, never an error
//! - STATUS round-trips through the anonymous reply queue
//! - connection retry gives up after the configured attempt count

use std::sync::Arc;
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

use fanline::broker::Broker;
use fanline::client::{LineWriter, ReadAggregator};
use fanline::config::Config;
use fanline::messaging::{BrokerConnection, MessagingError, ReplyRouter};
use fanline::replica::ReplicaHandler;
use fanline::store::{LineStore, MemoryStore};

/// Short windows so failing tests fail fast.
fn test_config(broker_addr: &str, expected_replicas: usize) -> Config {
    Config {
        broker_addr: broker_addr.to_string(),
        connect_retry_count: 2,
        connect_retry_delay: Duration::from_millis(50),
        control_timeout: Duration::from_millis(2000),
        response_timeout: Duration::from_millis(1500),
        response_poll_interval: Duration::from_millis(25),
        expected_replicas,
        ..Config::default()
    }
}

/// Bind a broker on an ephemeral port, spawn its accept loop, return the
/// address clients should dial.
async fn start_broker() -> String {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let addr = broker.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = broker.run().await;
    });
    addr
}

/// Start a replica daemon on its own connection, sharing its store with the
/// test for direct inspection and seeding.
async fn start_replica(cfg: &Config, id: u32) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let conn = BrokerConnection::connect(cfg.clone()).await.unwrap();
    let handler = ReplicaHandler::start(conn, id, Arc::clone(&store))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = handler.run().await;
    });
    store
}

/// TCP relay in front of the broker whose live session the test can cut,
/// forcing clients on the near side to detect the drop and reconnect. The
/// relay keeps accepting, so a reconnect attempt goes through.
struct FlakyLink {
    addr: String,
    cut: Arc<Notify>,
}

async fn start_flaky_link(upstream: String) -> FlakyLink {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cut = Arc::new(Notify::new());
    let trigger = Arc::clone(&cut);
    tokio::spawn(async move {
        loop {
            let Ok((mut near, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut far) = TcpStream::connect(&upstream).await else {
                break;
            };
            tokio::select! {
                _ = copy_bidirectional(&mut near, &mut far) => {}
                _ = trigger.notified() => {}
            }
        }
    });
    FlakyLink { addr, cut }
}

async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    done()
}

// =============================================================================
// Write Fanout Tests
// =============================================================================

/// One broadcast WRITE lands in every replica's store.
#[tokio::test]
async fn test_write_broadcast_reaches_every_replica() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 2);
    let store_a = start_replica(&cfg, 1).await;
    let store_b = start_replica(&cfg, 2).await;

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let writer = LineWriter::new(Arc::clone(&conn));
    writer.write_line(1, "Hello").await.unwrap();

    let replicated = wait_until(Duration::from_secs(2), || {
        store_a.len() == 1 && store_b.len() == 1
    })
    .await;
    assert!(replicated, "write did not reach both replicas");

    for store in [&store_a, &store_b] {
        let record = store.most_recent().unwrap().unwrap();
        assert_eq!(record.line_number, 1);
        assert_eq!(record.content, "Hello");
    }
    conn.close().await;
}

/// Writes published while a replica's queue is bound but unconsumed are
/// buffered and delivered once the consumer attaches.
#[tokio::test]
async fn test_durable_queue_buffers_for_late_consumer() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 1);

    // Declare and bind the queue without consuming yet.
    let replica_conn = BrokerConnection::connect(cfg.clone()).await.unwrap();
    let handler = ReplicaHandler::start(Arc::clone(&replica_conn), 1, Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    assert_eq!(handler.queue_name(), "replica_queue_1");

    let client_conn = BrokerConnection::connect(cfg.clone()).await.unwrap();
    LineWriter::new(Arc::clone(&client_conn))
        .write_line(5, "buffered while down")
        .await
        .unwrap();

    // Now attach the consumer and read back what was buffered.
    tokio::spawn(async move {
        let _ = handler.run().await;
    });
    let router = ReplyRouter::new(Arc::clone(&client_conn));
    let aggregator = ReadAggregator::new(Arc::clone(&client_conn), router);
    let outcome = aggregator.read_last().await.unwrap();

    let resolved = outcome.resolved.expect("buffered write was lost");
    assert_eq!(resolved.line_number, 5);
    assert_eq!(resolved.content, "buffered while down");
    client_conn.close().await;
    replica_conn.close().await;
}

// =============================================================================
// Read Aggregation Tests
// =============================================================================

/// The freshest timestamp wins across replicas, whatever the arrival order.
#[tokio::test]
async fn test_read_last_resolves_freshest_across_replicas() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 3);
    let stores = [
        start_replica(&cfg, 1).await,
        start_replica(&cfg, 2).await,
        start_replica(&cfg, 3).await,
    ];
    stores[0].append(1, "stale", 100).unwrap();
    stores[1].append(1, "freshest", 300).unwrap();
    stores[2].append(1, "middle", 200).unwrap();

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    let outcome = aggregator.read_last().await.unwrap();
    assert_eq!(outcome.success_count, 3);
    assert_eq!(outcome.error_count, 0);
    let resolved = outcome.resolved.unwrap();
    assert_eq!(resolved.content, "freshest");
    assert_eq!(resolved.timestamp, 300);
    assert_eq!(resolved.replica_id, 2);
    conn.close().await;
}

/// With no replicas running, the window elapses and the read reports a
/// clean no-answer instead of failing.
#[tokio::test]
async fn test_read_last_with_no_replicas_is_silent_not_an_error() {
    let addr = start_broker().await;
    let mut cfg = test_config(&addr, 2);
    cfg.response_timeout = Duration::from_millis(300);

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    let outcome = aggregator.read_last().await.unwrap();
    assert!(outcome.resolved.is_none());
    assert_eq!(outcome.success_count, 0);
    assert_eq!(outcome.error_count, 0);
    conn.close().await;
}

/// READ ALL collects each replica's full listing, ordered by line number.
#[tokio::test]
async fn test_read_all_collects_every_listing() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 2);
    let store_a = start_replica(&cfg, 1).await;
    let store_b = start_replica(&cfg, 2).await;
    store_a.append(2, "b", 20).unwrap();
    store_a.append(1, "a", 10).unwrap();
    store_b.append(1, "a", 10).unwrap();

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    let mut replies = aggregator.read_all().await.unwrap();
    replies.sort_by_key(|r| r.replica_id);
    assert_eq!(replies.len(), 2);

    let lines_a = replies[0].lines.as_ref().unwrap();
    assert_eq!(lines_a.len(), 2);
    assert_eq!(lines_a[0].line_number, 1);
    assert_eq!(lines_a[1].line_number, 2);
    assert_eq!(replies[1].lines.as_ref().unwrap().len(), 1);
    conn.close().await;
}

// =============================================================================
// Status / Liveness Tests
// =============================================================================

/// STATUS round-trips: the first replica to answer reports its queue name
/// and record count.
#[tokio::test]
async fn test_status_probe_reports_queue_and_count() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 1);
    let store = start_replica(&cfg, 7).await;
    store.append(1, "x", 1).unwrap();

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    let reply = aggregator.status_probe().await.unwrap().unwrap();
    assert_eq!(reply.replica_id, 7);
    assert_eq!(reply.status.as_deref(), Some("online"));
    assert_eq!(reply.queue_name.as_deref(), Some("replica_queue_7"));
    assert_eq!(reply.line_count, Some(1));
    conn.close().await;
}

/// A burst larger than the prefetch window drains completely; prefetch
/// bounds in-flight hops, never total throughput.
#[tokio::test]
async fn test_prefetch_window_never_stalls_delivery() {
    let addr = start_broker().await;
    let mut cfg = test_config(&addr, 1);
    cfg.prefetch_count = 2;
    let store = start_replica(&cfg, 1).await;

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let writer = LineWriter::new(Arc::clone(&conn));
    for i in 1..=5 {
        writer.write_line(i, "burst").await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || store.len() == 5).await);
    conn.close().await;
}

// =============================================================================
// Connection Lifecycle Tests
// =============================================================================

/// Connecting to a dead address retries the configured number of times,
/// then reports exhaustion.
#[tokio::test]
async fn test_connect_retry_exhaustion() {
    // Grab a port that refuses connections by binding and dropping it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let cfg = Config {
        connect_retry_count: 2,
        connect_retry_delay: Duration::from_millis(10),
        ..test_config(&dead_addr, 1)
    };
    match BrokerConnection::connect(cfg).await {
        Err(MessagingError::ConnectionExhausted { attempts, addr, .. }) => {
            assert_eq!(attempts, 2);
            assert_eq!(addr, dead_addr);
        }
        other => panic!("expected ConnectionExhausted, got {:?}", other.map(|_| ())),
    }
}

/// A severed connection recovers on the next operation: the publish path
/// re-establishes, bumps the generation, and the write still fans out.
#[tokio::test]
async fn test_publish_reconnects_after_link_drop() {
    let broker_addr = start_broker().await;
    let link = start_flaky_link(broker_addr.clone()).await;
    let store = start_replica(&test_config(&broker_addr, 1), 1).await;

    let mut cfg = test_config(&link.addr, 1);
    cfg.control_timeout = Duration::from_millis(500);
    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let writer = LineWriter::new(Arc::clone(&conn));
    writer.write_line(1, "before the cut").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || store.len() == 1).await);

    let generation = conn.generation();
    link.cut.notify_one();

    // The first attempt can race the drop detection; retry within a bound.
    let end = Instant::now() + Duration::from_secs(4);
    loop {
        match writer.write_line(2, "after the cut").await {
            Ok(()) => break,
            Err(_) if Instant::now() < end => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("publish never recovered after the cut: {}", e),
        }
    }
    assert!(conn.generation() > generation);
    assert!(wait_until(Duration::from_secs(2), || store.len() == 2).await);
    conn.close().await;
}

/// The anonymous reply queue dies with its connection; after a reconnect the
/// router declares a fresh one for the new generation and reads resolve
/// again.
#[tokio::test]
async fn test_reply_queue_rebuilt_after_reconnect() {
    let broker_addr = start_broker().await;
    let link = start_flaky_link(broker_addr.clone()).await;
    let store = start_replica(&test_config(&broker_addr, 1), 1).await;
    store.append(3, "survivor", 70).unwrap();

    let mut cfg = test_config(&link.addr, 1);
    cfg.control_timeout = Duration::from_millis(500);
    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let aggregator = ReadAggregator::new(Arc::clone(&conn), router);

    let outcome = aggregator.read_last().await.unwrap();
    assert_eq!(outcome.resolved.as_ref().unwrap().content, "survivor");

    link.cut.notify_one();

    // The first read after the cut may still address the dead reply queue;
    // the one after that must run against a freshly declared queue.
    let end = Instant::now() + Duration::from_secs(5);
    let resolved = loop {
        if let Ok(outcome) = aggregator.read_last().await {
            if let Some(resolved) = outcome.resolved {
                break resolved;
            }
        }
        assert!(Instant::now() < end, "read never recovered after the cut");
        sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(resolved.content, "survivor");
    conn.close().await;
}

/// Durable consumers re-attach when their connection is re-established, so
/// fanned-out writes resume reaching the replica's store.
#[tokio::test]
async fn test_durable_consumer_reattaches_after_reconnect() {
    let broker_addr = start_broker().await;
    let link = start_flaky_link(broker_addr.clone()).await;

    let mut replica_cfg = test_config(&link.addr, 1);
    replica_cfg.control_timeout = Duration::from_millis(500);
    let store = Arc::new(MemoryStore::new());
    let replica_conn = BrokerConnection::connect(replica_cfg).await.unwrap();
    let handler = ReplicaHandler::start(Arc::clone(&replica_conn), 1, Arc::clone(&store))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = handler.run().await;
    });

    let client_conn = BrokerConnection::connect(test_config(&broker_addr, 1))
        .await
        .unwrap();
    let writer = LineWriter::new(Arc::clone(&client_conn));
    writer.write_line(1, "first").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || store.len() == 1).await);

    link.cut.notify_one();

    // Nudge the replica's connection with an idempotent topology call;
    // establishing the new session re-attaches the durable consumer.
    let end = Instant::now() + Duration::from_secs(4);
    loop {
        match replica_conn.declare_replica_queue(1).await {
            Ok(_) => break,
            Err(_) if Instant::now() < end => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("reconnect never completed: {}", e),
        }
    }

    writer.write_line(2, "second").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || store.len() == 2).await);
    client_conn.close().await;
}

/// Two concurrent in-flight reads on one connection never cross-complete:
/// each resolves from its own correlation ID.
#[tokio::test]
async fn test_concurrent_reads_are_isolated() {
    let addr = start_broker().await;
    let cfg = test_config(&addr, 1);
    let store = start_replica(&cfg, 1).await;
    store.append(4, "only line", 50).unwrap();

    let conn = BrokerConnection::connect(cfg).await.unwrap();
    let router = ReplyRouter::new(Arc::clone(&conn));
    let a = ReadAggregator::new(Arc::clone(&conn), Arc::clone(&router));
    let b = ReadAggregator::new(Arc::clone(&conn), router);

    let (first, second) = tokio::join!(a.read_last(), b.read_last());
    for outcome in [first.unwrap(), second.unwrap()] {
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.resolved.unwrap().content, "only line");
    }
    conn.close().await;
}
