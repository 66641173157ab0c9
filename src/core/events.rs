// src/core/events.rs

//! Typed lifecycle events emitted by connections and subscribers.
//!
//! These replace string event names with strongly typed enums: a connection
//! publishes `ConnectionEvent`s, and a subscriber re-tags them with the
//! originating host as `HostEvent`s alongside its own controller events.

use crate::core::NsqError;

/// The capacity of the broadcast channels carrying lifecycle events. Events
/// are advisory; a lagging receiver skips old ones rather than applying
/// backpressure to the connection.
pub(crate) const EVENT_BUS_CAPACITY: usize = 64;

/// A lifecycle event from a single nsqd connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The TCP connection is established; the identify handshake follows.
    Connected,
    /// Feature negotiation completed; the connection accepts commands.
    Ready,
    /// The socket dropped before an explicit close.
    Disconnected,
    /// A reconnect attempt succeeded after one or more failures.
    Reconnected { attempt: u32 },
    /// The outbound command queue drained.
    Drained,
    /// The connection holds a ready count of zero while subscribed.
    Paused,
    /// Graceful close completed.
    Closed,
    /// Reconnect attempts are exhausted; the connection is terminal.
    Failed,
    /// An asynchronous failure with no caller to return to.
    Error(NsqError),
}

/// A `ConnectionEvent` tagged with the nsqd it originated from.
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub host: String,
    pub port: u16,
    pub event: ConnectionEvent,
}

/// An event from a subscriber's discovery/readiness controller.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// A lifecycle event from one of the subscriber's connections.
    Connection(HostEvent),
    /// A producer discovered via lookup (or configured directly) was added
    /// to the connection set.
    ProducerAdded { address: String },
    /// A producer disappeared from lookup results or the subscriber closed.
    ProducerRemoved { address: String },
    /// A discovery poll started.
    PollBegin,
    /// A discovery poll finished; the next one is scheduled.
    PollComplete,
    /// A single lookup URL failed. Never aborts the poll; carries
    /// `ELOOKUPERROR` via [`NsqError::code`].
    LookupFailed { host: String, error: NsqError },
}
