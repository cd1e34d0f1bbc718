//! Embedded message broker
//!
//! A small TCP broker implementing exactly the primitives the protocol layer
//! consumes: one durable fanout exchange, named durable queues, the default
//! direct exchange for point-to-point replies, exclusive auto-delete
//! anonymous reply queues, and per-consumer prefetch. It stands in for an
//! external AMQP broker so the whole system runs self-contained.
//!
//! Framing is newline-delimited JSON (`wire::ClientFrame` /
//! `wire::BrokerFrame`). Every client frame receives exactly one control
//! response, in order; deliveries are interleaved on the same stream.

mod exchange;
mod server;

pub use exchange::BrokerError;
pub use server::Broker;
