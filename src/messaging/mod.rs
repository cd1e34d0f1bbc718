//! Messaging protocol layer
//!
//! Client-side plumbing shared by replicas and clients:
//! - `BrokerConnection`: one TCP connection to the broker with bounded retry
//!   connect, drop detection, reconnect-on-demand, and the publish/declare/
//!   consume operations the topology needs;
//! - `ReplyRouter`: demultiplexes the anonymous reply queue by correlation
//!   ID to any number of subscribers;
//! - `RequestReplyCoordinator`: a one-shot request/first-reply future built
//!   on top of the router.

mod connection;
mod errors;
mod reply;

pub use connection::BrokerConnection;
pub use errors::{MessagingError, MessagingResult};
pub use reply::{ReplyRouter, ReplySubscription, RequestReplyCoordinator};
