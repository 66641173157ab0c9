// src/lib.rs

//! An async client for the NSQ distributed message broker.
//!
//! Two roles share a common per-connection core: a [`Publisher`] sends
//! messages to one nsqd, and a [`Subscriber`] receives messages for a
//! `(topic, channel)` pair from every nsqd carrying the topic, discovered
//! directly or through nsqlookupd polling.

pub mod config;
pub mod connection;
pub mod core;
pub mod lookup;
pub mod publisher;
pub mod subscriber;

// Re-export
pub use crate::config::{ConnectionConfig, NsqdAddress, PublisherConfig, SubscriberConfig};
pub use crate::connection::{Connection, ConnectionState, IdentifyResponse};
pub use crate::core::NsqError;
pub use crate::core::events::{ConnectionEvent, HostEvent, SubscriberEvent};
pub use crate::core::message::{Message, MessageId};
pub use crate::core::protocol::MessageBody;
pub use crate::publisher::{Payload, Publisher};
pub use crate::subscriber::Subscriber;
