// src/connection/mod.rs

//! A single client connection to one nsqd node.
//!
//! `Connection` is a cheap handle; the real work happens in the actor task
//! it spawns (see `actor`). Dropping the handle aborts the actor; `close`
//! runs the graceful drain protocol instead.

pub(crate) mod actor;
pub mod backoff;
pub(crate) mod inflight;
pub mod state;

pub use actor::IdentifyResponse;
pub use state::ConnectionState;

use crate::config::{ConnectionConfig, NsqdAddress};
use crate::core::NsqError;
use crate::core::events::{ConnectionEvent, EVENT_BUS_CAPACITY};
use crate::core::protocol::Command;
use actor::{ActorOptions, ActorRequest, ConnectionActor, ConnectionShared, REQUEST_QUEUE_CAPACITY};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// A handle to one nsqd connection.
#[derive(Debug)]
pub struct Connection {
    address: NsqdAddress,
    requests: mpsc::Sender<ActorRequest>,
    events: broadcast::Sender<ConnectionEvent>,
    status: watch::Receiver<ConnectionState>,
    shared: Arc<ConnectionShared>,
    task: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Spawns the connection actor and returns its handle. The actor starts
    /// connecting immediately.
    pub(crate) fn spawn(
        address: NsqdAddress,
        config: ConnectionConfig,
        options: ActorOptions,
    ) -> Connection {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(ConnectionShared::default());

        let actor = ConnectionActor::new(
            address.clone(),
            config,
            options,
            requests_rx,
            requests_tx.clone(),
            events_tx.clone(),
            status_tx,
            Arc::clone(&shared),
        );
        let task = tokio::spawn(actor.run());

        Connection {
            address,
            requests: requests_tx,
            events: events_tx,
            status: status_rx,
            shared,
            task,
        }
    }

    pub fn address(&self) -> &NsqdAddress {
        &self.address
    }

    /// The connection's current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// A watch over lifecycle state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Subscribes to lifecycle events. Receivers that lag skip old events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The features negotiated during the last identify handshake.
    pub fn features(&self) -> Option<IdentifyResponse> {
        self.shared.features.lock().clone()
    }

    /// The last RDY count written to the wire.
    pub fn ready_count(&self) -> u64 {
        self.shared.ready_count.load(Ordering::Relaxed)
    }

    /// Messages currently awaiting FIN/REQ on this connection.
    pub fn inflight_count(&self) -> usize {
        self.shared.inflight_count.load(Ordering::Relaxed)
    }

    /// Unix milliseconds of the last received message, 0 when none yet.
    pub fn last_message_at_ms(&self) -> u64 {
        self.shared.last_message_at_ms.load(Ordering::Relaxed)
    }

    /// Blocks until the connection is established, or fails with the
    /// terminal error when it never gets there.
    pub async fn wait_ready(&self) -> Result<(), NsqError> {
        let mut status = self.status.clone();
        loop {
            let state = *status.borrow_and_update();
            if state.is_established() {
                return Ok(());
            }
            match state {
                ConnectionState::Failed => return Err(NsqError::MaxReconnectsExceeded),
                ConnectionState::Closed => return Err(NsqError::Terminated),
                _ => {}
            }
            status
                .changed()
                .await
                .map_err(|_| NsqError::Terminated)?;
        }
    }

    /// Submits a command, resolving with the RESPONSE payload for
    /// response-bearing commands or `None` once fire-and-forget commands
    /// are written.
    pub(crate) async fn submit(&self, command: Command) -> Result<Option<Bytes>, NsqError> {
        let (reply, done) = oneshot::channel();
        self.requests
            .send(ActorRequest::Submit { command, reply })
            .await
            .map_err(|_| NsqError::Terminated)?;
        done.await.map_err(|_| NsqError::Terminated)?
    }

    /// Updates the connection's ready count (RDY).
    pub async fn set_ready(&self, count: u64) -> Result<(), NsqError> {
        self.submit(Command::Rdy(count)).await.map(|_| ())
    }

    /// Marks teardown as abortive: a later `close` (including the one a
    /// controlling subscriber issues during shutdown) skips the graceful
    /// CLS/drain sequence.
    pub fn unref(&self) {
        self.shared.abortive_close.store(true, Ordering::Relaxed);
    }

    /// Runs the graceful close protocol: CLS when subscribed, inflight
    /// drain bounded by `msg_timeout`, queue drain, half-close.
    pub async fn close(self) -> Result<(), NsqError> {
        let (done, finished) = oneshot::channel();
        if self
            .requests
            .send(ActorRequest::Close { done })
            .await
            .is_err()
        {
            // The actor is already gone.
            return Ok(());
        }
        finished.await.unwrap_or(Ok(()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
