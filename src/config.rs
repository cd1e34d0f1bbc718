//! Runtime configuration
//!
//! Every tunable the protocol layer depends on (broker address, topology
//! names, retry bounds, response windows) lives here. Configured externally
//! (defaults, environment, CLI flags), immutable after startup.

use std::env;
use std::time::Duration;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "FANLINE_";

/// Shared configuration for brokers, replicas and clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Broker TCP address (host:port).
    pub broker_addr: String,

    /// Name of the shared durable fanout exchange.
    pub exchange: String,

    /// Prefix for per-replica durable queue names; the queue for replica
    /// `id` is `<queue_prefix><id>`.
    pub queue_prefix: String,

    /// Connection attempts before giving up.
    pub connect_retry_count: u32,

    /// Fixed delay between connection attempts.
    pub connect_retry_delay: Duration,

    /// Bound on a control-frame round trip with the broker.
    pub control_timeout: Duration,

    /// Total window a client waits for replica responses.
    pub response_timeout: Duration,

    /// Poll interval while collecting responses inside the window.
    pub response_poll_interval: Duration,

    /// Per-consumer cap on in-flight deliveries.
    pub prefetch_count: usize,

    /// Replica count used for early exit during read aggregation.
    pub expected_replicas: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:5682".to_string(),
            exchange: "replica_exchange".to_string(),
            queue_prefix: "replica_queue_".to_string(),
            connect_retry_count: 3,
            connect_retry_delay: Duration::from_millis(1000),
            control_timeout: Duration::from_millis(5000),
            response_timeout: Duration::from_millis(2000),
            response_poll_interval: Duration::from_millis(100),
            prefetch_count: 10,
            expected_replicas: 2,
        }
    }
}

impl Config {
    /// Build a configuration from defaults plus `FANLINE_*` environment
    /// overrides. Unparseable values fall back to the default silently;
    /// configuration must never abort a daemon at startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_string("BROKER_ADDR") {
            cfg.broker_addr = v;
        }
        if let Some(v) = env_string("EXCHANGE") {
            cfg.exchange = v;
        }
        if let Some(v) = env_string("QUEUE_PREFIX") {
            cfg.queue_prefix = v;
        }
        if let Some(v) = env_parse("CONNECT_RETRY_COUNT") {
            cfg.connect_retry_count = v;
        }
        if let Some(v) = env_parse("CONNECT_RETRY_DELAY_MS") {
            cfg.connect_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("CONTROL_TIMEOUT_MS") {
            cfg.control_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("RESPONSE_TIMEOUT_MS") {
            cfg.response_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("RESPONSE_POLL_INTERVAL_MS") {
            cfg.response_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("PREFETCH_COUNT") {
            cfg.prefetch_count = v;
        }
        if let Some(v) = env_parse("EXPECTED_REPLICAS") {
            cfg.expected_replicas = v;
        }

        cfg
    }

    /// Durable queue name for a replica ID.
    pub fn replica_queue_name(&self, replica_id: u32) -> String {
        format!("{}{}", self.queue_prefix, replica_id)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
