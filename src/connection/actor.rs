// src/connection/actor.rs

//! The per-connection task.
//!
//! One actor owns everything a single nsqd connection needs: the TCP
//! socket, the identify handshake, the FIFO command queue with its single
//! outstanding response waiter, the inflight message map and its expiry
//! timer, heartbeat replies, reconnection with backoff, and the two-stage
//! graceful close (inflight drain, then queue drain). All of it runs in a
//! single `select!` loop so frame processing, queue pulsing, and timers for
//! one connection observe a total order.

use super::backoff::Backoff;
use super::inflight::InflightMap;
use super::state::ConnectionState;
use crate::config::{ConnectionConfig, NsqdAddress};
use crate::core::NsqError;
use crate::core::events::{ConnectionEvent, HostEvent};
use crate::core::message::{Message, MessageTiming, ParsedMessage};
use crate::core::protocol::{Command, Frame, HEARTBEAT, MAGIC_V2, NsqCodec};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel feeding the actor. Large enough that
/// submitters only block when the connection is genuinely backed up.
pub(crate) const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// nsqd defaults, used until feature negotiation replaces them.
const DEFAULT_MSG_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_MSG_TIMEOUT_MS: u64 = 15 * 60_000;

/// Bound on waiting for the server's half of the close handshake.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Negotiated server features from the IDENTIFY response.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyResponse {
    #[serde(default = "default_msg_timeout")]
    pub msg_timeout: u64,
    #[serde(default = "default_max_msg_timeout")]
    pub max_msg_timeout: u64,
    #[serde(default)]
    pub max_rdy_count: u64,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub version: String,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        IdentifyResponse {
            msg_timeout: default_msg_timeout(),
            max_msg_timeout: default_max_msg_timeout(),
            max_rdy_count: 0,
            auth_required: false,
            version: String::new(),
        }
    }
}

fn default_msg_timeout() -> u64 {
    DEFAULT_MSG_TIMEOUT_MS
}
fn default_max_msg_timeout() -> u64 {
    DEFAULT_MAX_MSG_TIMEOUT_MS
}

/// A request sent from a `Connection` handle (or a `Message`) to its actor.
#[derive(Debug)]
pub(crate) enum ActorRequest {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Option<Bytes>, NsqError>>,
    },
    Close {
        done: oneshot::Sender<Result<(), NsqError>>,
    },
}

/// State shared between the actor and its handle without a round trip.
#[derive(Debug, Default)]
pub(crate) struct ConnectionShared {
    /// Unix milliseconds of the last MESSAGE frame; 0 when none arrived yet.
    pub last_message_at_ms: AtomicU64,
    /// The last RDY count written to the wire.
    pub ready_count: AtomicU64,
    pub inflight_count: AtomicUsize,
    /// Set by `unref`: close abortively instead of draining.
    pub abortive_close: AtomicBool,
    pub features: Mutex<Option<IdentifyResponse>>,
}

/// Construction options for an actor, chosen by Publisher vs Subscriber.
pub(crate) struct ActorOptions {
    /// A (topic, channel) the connection subscribes to on every `Ready`,
    /// including the first.
    pub subscription: Option<(String, String)>,
    pub keepalive_offset: Duration,
    /// Where MESSAGE frames are delivered. `None` for publishers.
    pub message_sink: Option<mpsc::Sender<Message>>,
    /// Host-tagged event mirror for a controlling subscriber.
    pub observer: Option<mpsc::Sender<HostEvent>>,
}

/// An entry in the FIFO command queue. `reply` is `None` for commands the
/// actor generates itself (heartbeat NOPs, re-subscribes, CLS).
struct Envelope {
    command: Command,
    reply: Option<oneshot::Sender<Result<Option<Bytes>, NsqError>>>,
}

/// The single outstanding response-bearing command.
struct PendingResponse {
    name: &'static str,
    reply: Option<oneshot::Sender<Result<Option<Bytes>, NsqError>>>,
}

struct CloseRequest {
    done: Vec<oneshot::Sender<Result<(), NsqError>>>,
    /// Inflight drain bound: `msg_timeout` past the close call.
    deadline: Instant,
}

enum ConnectOutcome {
    Stream(TcpStream),
    /// Close was requested before a socket existed; the actor already
    /// resolved it and should exit.
    Stopped,
    Error(NsqError),
}

enum ServeExit {
    Closed,
}

pub(crate) struct ConnectionActor {
    address: NsqdAddress,
    config: ConnectionConfig,
    subscription: Option<(String, String)>,
    keepalive_offset: Duration,
    requests: mpsc::Receiver<ActorRequest>,
    requests_tx: mpsc::Sender<ActorRequest>,
    events: broadcast::Sender<ConnectionEvent>,
    observer: Option<mpsc::Sender<HostEvent>>,
    status: watch::Sender<ConnectionState>,
    shared: Arc<ConnectionShared>,
    message_sink: Option<mpsc::Sender<Message>>,
    queue: VecDeque<Envelope>,
    pending: Option<PendingResponse>,
    inflight: InflightMap,
    last_ready: u64,
    close: Option<CloseRequest>,
}

impl ConnectionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: NsqdAddress,
        config: ConnectionConfig,
        options: ActorOptions,
        requests: mpsc::Receiver<ActorRequest>,
        requests_tx: mpsc::Sender<ActorRequest>,
        events: broadcast::Sender<ConnectionEvent>,
        status: watch::Sender<ConnectionState>,
        shared: Arc<ConnectionShared>,
    ) -> Self {
        ConnectionActor {
            address,
            config,
            subscription: options.subscription,
            keepalive_offset: options.keepalive_offset,
            requests,
            requests_tx,
            events,
            observer: options.observer,
            status,
            shared,
            message_sink: options.message_sink,
            queue: VecDeque::new(),
            pending: None,
            inflight: InflightMap::default(),
            last_ready: 0,
            close: None,
        }
    }

    /// The outer connection lifecycle: connect, serve, reconnect with
    /// backoff, until a clean close or the attempt budget runs out.
    pub(crate) async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.config.reconnect_delay_factor(),
            self.config.max_reconnect_delay(),
            self.config.max_connect_attempts.max(1),
        );
        let mut connected_before = false;

        loop {
            self.transition(ConnectionState::Connecting);
            match self.connect_phase().await {
                ConnectOutcome::Stream(stream) => {
                    info!("connected to nsqd at {}", self.address);
                    self.emit(ConnectionEvent::Connected);
                    if connected_before {
                        self.emit(ConnectionEvent::Reconnected {
                            attempt: backoff.attempts(),
                        });
                    }
                    connected_before = true;
                    backoff.reset();

                    match self.serve(stream).await {
                        Ok(ServeExit::Closed) => return,
                        Err(e) => {
                            warn!("connection to {} dropped: {e}", self.address);
                        }
                    }
                    self.on_disconnect();
                }
                ConnectOutcome::Stopped => return,
                ConnectOutcome::Error(e) => {
                    warn!("connect to {} failed: {e}", self.address);
                    self.on_disconnect();
                }
            }

            if let Some(close) = self.close.take() {
                // A close that raced the disconnect: nothing left to drain.
                self.reject_queued(&NsqError::Terminated);
                self.transition(ConnectionState::Closed);
                self.emit(ConnectionEvent::Closed);
                for done in close.done {
                    let _ = done.send(Ok(()));
                }
                return;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    info!(
                        "reconnecting to {} in {delay:?} (attempt {})",
                        self.address,
                        backoff.attempts()
                    );
                    if !self.backoff_wait(delay).await {
                        return;
                    }
                }
                None => {
                    self.fail_terminal();
                    return;
                }
            }
        }
    }

    /// Establishes the TCP connection while staying responsive to requests.
    /// Submissions queue up for after the connect; a close waits for the
    /// connect to settle, then tears down.
    async fn connect_phase(&mut self) -> ConnectOutcome {
        let addr = self.address.to_string();
        let connect = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(stream)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("failed to set TCP_NODELAY on {}: {e}", self.address);
                            }
                            ConnectOutcome::Stream(stream)
                        }
                        Ok(Err(e)) => ConnectOutcome::Error(e.into()),
                        Err(_) => {
                            ConnectOutcome::Error(NsqError::ConnectTimeout(self.address.to_string()))
                        }
                    };
                }
                maybe_req = self.requests.recv() => match maybe_req {
                    Some(ActorRequest::Submit { command, reply }) => {
                        self.queue.push_back(Envelope { command, reply: Some(reply) });
                    }
                    Some(ActorRequest::Close { done }) => {
                        // Wait out the in-progress connect, then tear down.
                        if let Ok(Ok(stream)) = (&mut connect).await {
                            drop(stream);
                        }
                        self.reject_queued(&NsqError::Terminated);
                        self.transition(ConnectionState::Closed);
                        self.emit(ConnectionEvent::Closed);
                        let _ = done.send(Ok(()));
                        return ConnectOutcome::Stopped;
                    }
                    None => {
                        self.transition(ConnectionState::Closed);
                        return ConnectOutcome::Stopped;
                    }
                }
            }
        }
    }

    /// Sleeps out a reconnect delay. Returns false when a close arrived and
    /// the actor should exit.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                maybe_req = self.requests.recv() => match maybe_req {
                    Some(ActorRequest::Submit { command, reply }) => {
                        self.queue.push_back(Envelope { command, reply: Some(reply) });
                    }
                    Some(ActorRequest::Close { done }) => {
                        self.reject_queued(&NsqError::Terminated);
                        self.transition(ConnectionState::Closed);
                        self.emit(ConnectionEvent::Closed);
                        let _ = done.send(Ok(()));
                        return false;
                    }
                    None => {
                        self.transition(ConnectionState::Closed);
                        return false;
                    }
                }
            }
        }
    }

    /// One established-socket lifetime: magic, identify, optional auth,
    /// subscription continuity, then the main frame/queue/timer loop.
    async fn serve(&mut self, stream: TcpStream) -> Result<ServeExit, NsqError> {
        let (read_half, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(read_half, NsqCodec);

        self.transition(ConnectionState::Identifying);
        writer.write_all(MAGIC_V2).await?;

        let mut buf = BytesMut::new();
        Command::Identify(self.identify_payload()).encode_to(&mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;

        // A server that accepts TCP but never answers the handshake must
        // not wedge the actor.
        let handshake_timeout = self.config.connect_timeout();
        let features =
            tokio::time::timeout(handshake_timeout, self.await_identify(&mut frames))
                .await
                .map_err(|_| NsqError::Identify("timed out waiting for the IDENTIFY response".into()))??;
        debug!(
            "identified with {}: msg_timeout={}ms max_msg_timeout={}ms",
            self.address, features.msg_timeout, features.max_msg_timeout
        );
        let auth_required = features.auth_required;
        *self.shared.features.lock() = Some(features);

        if auth_required {
            tokio::time::timeout(handshake_timeout, self.authenticate(&mut frames, &mut writer))
                .await
                .map_err(|_| NsqError::Identify("timed out waiting for the AUTH response".into()))??;
        }

        self.transition(ConnectionState::Ready);
        self.emit(ConnectionEvent::Ready);

        // Subscription continuity: SUB, then the previous RDY, ahead of any
        // queued user commands.
        if let Some((topic, channel)) = self.subscription.clone() {
            if self.last_ready > 0 {
                self.queue.push_front(Envelope {
                    command: Command::Rdy(self.last_ready),
                    reply: None,
                });
            }
            self.queue.push_front(Envelope {
                command: Command::Sub { topic, channel },
                reply: None,
            });
        }

        loop {
            self.pulse(&mut writer).await?;

            if self.close_complete() {
                return self.finish_close(&mut frames, &mut writer).await;
            }

            let inflight_deadline = self.inflight.next_deadline();
            let close_deadline = self.close.as_ref().map(|c| c.deadline);
            let inflight_at = inflight_deadline.unwrap_or_else(far_future);
            let close_at = close_deadline.unwrap_or_else(far_future);

            tokio::select! {
                biased;
                maybe_req = self.requests.recv() => match maybe_req {
                    Some(req) => self.handle_request(req),
                    // Every handle and message is gone; drain and close.
                    None => self.begin_close(None),
                },
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by server",
                        )
                        .into());
                    }
                },
                _ = tokio::time::sleep_until(inflight_at), if inflight_deadline.is_some() => {
                    for id in self.inflight.expire(Instant::now()) {
                        debug!("inflight message {id} expired without FIN/REQ");
                    }
                    self.shared
                        .inflight_count
                        .store(self.inflight.len(), Ordering::Relaxed);
                },
                _ = tokio::time::sleep_until(close_at), if close_deadline.is_some() => {
                    warn!(
                        "close timed out with {} inflight messages; releasing",
                        self.inflight.len()
                    );
                    self.inflight.clear();
                    self.shared.inflight_count.store(0, Ordering::Relaxed);
                    self.fail_pending(&NsqError::CloseTimeout);
                    self.reject_queued(&NsqError::CloseTimeout);
                },
            }
        }
    }

    /// Reads the IDENTIFY response, answering any heartbeat that sneaks in
    /// first. A bare `OK` means the server skipped feature negotiation.
    async fn await_identify(
        &mut self,
        frames: &mut FramedRead<OwnedReadHalf, NsqCodec>,
    ) -> Result<IdentifyResponse, NsqError> {
        loop {
            match frames.next().await {
                Some(Ok(Frame::Response(body))) if body.as_ref() == HEARTBEAT => {
                    self.queue.push_front(Envelope {
                        command: Command::Nop,
                        reply: None,
                    });
                }
                Some(Ok(Frame::Response(body))) => {
                    if body.as_ref() == b"OK" {
                        return Ok(IdentifyResponse::default());
                    }
                    return serde_json::from_slice(&body).map_err(|e| {
                        NsqError::Identify(format!("unparseable IDENTIFY response: {e}"))
                    });
                }
                Some(Ok(Frame::Error(body))) => {
                    return Err(NsqError::from_error_frame(&body));
                }
                Some(Ok(Frame::Message(_))) => {
                    return Err(NsqError::Protocol(
                        "MESSAGE frame before identify completed".into(),
                    ));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(NsqError::Identify(
                        "server closed the connection during identify".into(),
                    ));
                }
            }
        }
    }

    /// Sends AUTH and waits for its response.
    async fn authenticate(
        &mut self,
        frames: &mut FramedRead<OwnedReadHalf, NsqCodec>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), NsqError> {
        let secret = self.config.auth_secret.clone().ok_or_else(|| {
            NsqError::Identify("server requires auth but no auth_secret is configured".into())
        })?;

        let mut buf = BytesMut::new();
        Command::Auth(Bytes::from(secret.into_bytes())).encode_to(&mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;

        loop {
            match frames.next().await {
                Some(Ok(Frame::Response(body))) if body.as_ref() == HEARTBEAT => {
                    self.queue.push_front(Envelope {
                        command: Command::Nop,
                        reply: None,
                    });
                }
                Some(Ok(Frame::Response(_))) => {
                    debug!("authenticated with {}", self.address);
                    return Ok(());
                }
                Some(Ok(Frame::Error(body))) => return Err(NsqError::from_error_frame(&body)),
                Some(Ok(Frame::Message(_))) => {
                    return Err(NsqError::Protocol("MESSAGE frame during auth".into()));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(NsqError::Identify(
                        "server closed the connection during auth".into(),
                    ));
                }
            }
        }
    }

    /// Writes queued envelopes until the queue empties or a
    /// response-bearing command takes the waiter slot.
    async fn pulse(&mut self, writer: &mut OwnedWriteHalf) -> Result<(), NsqError> {
        let mut wrote = false;

        while self.pending.is_none() {
            let Some(envelope) = self.queue.pop_front() else {
                break;
            };
            if !wrote {
                self.transition_established(ConnectionState::Pulsing);
                wrote = true;
            }

            let mut buf = BytesMut::new();
            if let Err(e) = envelope.command.encode_to(&mut buf) {
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(Err(e.clone()));
                }
                continue;
            }
            if let Err(e) = writer.write_all(&buf).await {
                let err: NsqError = e.into();
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(Err(err.clone()));
                }
                return Err(err);
            }
            debug!("sent {} to {}", envelope.command.name(), self.address);
            self.after_write(&envelope.command);

            if envelope.command.needs_response() {
                self.pending = Some(PendingResponse {
                    name: envelope.command.name(),
                    reply: envelope.reply,
                });
            } else if let Some(reply) = envelope.reply {
                let _ = reply.send(Ok(None));
            }
        }

        if wrote {
            writer.flush().await?;
            if self.queue.is_empty() && self.pending.is_none() {
                self.emit(ConnectionEvent::Drained);
            }
            self.restore_established_state();
        }
        Ok(())
    }

    /// Bookkeeping keyed off commands the actor just put on the wire.
    fn after_write(&mut self, command: &Command) {
        match command {
            Command::Sub { topic, channel } => {
                self.subscription = Some((topic.clone(), channel.clone()));
            }
            Command::Rdy(count) => {
                let previous = self.last_ready;
                self.last_ready = *count;
                self.shared.ready_count.store(*count, Ordering::Relaxed);
                self.restore_established_state();
                if *count == 0 && previous > 0 && self.subscription.is_some() {
                    self.emit(ConnectionEvent::Paused);
                }
            }
            Command::Fin(id) | Command::Req { id, .. } => {
                if self.inflight.remove(id) {
                    self.shared
                        .inflight_count
                        .store(self.inflight.len(), Ordering::Relaxed);
                } else {
                    debug!("disposition for untracked message {id}");
                }
            }
            Command::Touch(id) => {
                let deadline = Instant::now() + self.message_timing().msg_timeout;
                if !self.inflight.touch(id, deadline) {
                    debug!("TOUCH for untracked message {id}");
                }
            }
            _ => {}
        }
    }

    fn handle_request(&mut self, request: ActorRequest) {
        match request {
            ActorRequest::Submit { command, reply } => {
                // During close only message dispositions may still go out.
                let disposition = matches!(
                    command,
                    Command::Fin(_) | Command::Req { .. } | Command::Touch(_) | Command::Nop
                );
                if self.close.is_some() && !disposition {
                    let _ = reply.send(Err(NsqError::Terminated));
                    return;
                }
                self.queue.push_back(Envelope {
                    command,
                    reply: Some(reply),
                });
            }
            ActorRequest::Close { done } => self.begin_close(Some(done)),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), NsqError> {
        match frame {
            Frame::Response(body) if body.as_ref() == HEARTBEAT => {
                debug!("heartbeat from {}", self.address);
                self.queue.push_front(Envelope {
                    command: Command::Nop,
                    reply: None,
                });
                Ok(())
            }
            Frame::Response(body) => {
                match self.pending.take() {
                    Some(pending) => {
                        debug!("{} acknowledged by {}", pending.name, self.address);
                        if let Some(reply) = pending.reply {
                            let _ = reply.send(Ok(Some(body)));
                        }
                    }
                    None => debug!(
                        "unsolicited RESPONSE from {}: {:?}",
                        self.address,
                        String::from_utf8_lossy(&body)
                    ),
                }
                Ok(())
            }
            Frame::Error(body) => {
                let err = NsqError::from_error_frame(&body);
                warn!("server error from {}: {err}", self.address);
                match self.pending.take() {
                    Some(pending) => {
                        if let Some(reply) = pending.reply {
                            let _ = reply.send(Err(err.clone()));
                        }
                    }
                    None => self.emit(ConnectionEvent::Error(err.clone())),
                }
                if err.is_non_fatal_server_error() {
                    Ok(())
                } else {
                    // Fatal server errors half-close the socket; the outer
                    // loop reconnects.
                    Err(err)
                }
            }
            Frame::Message(body) => self.handle_message(body).await,
        }
    }

    async fn handle_message(&mut self, body: Bytes) -> Result<(), NsqError> {
        let parsed = ParsedMessage::parse(body)?;
        if self.close.is_some() {
            debug!("dropping message {} received during close", parsed.id);
            return Ok(());
        }

        let timing = self.message_timing();
        let id = parsed.id;
        let slot = self.inflight.insert(id, Instant::now() + timing.msg_timeout);
        self.shared
            .inflight_count
            .store(self.inflight.len(), Ordering::Relaxed);
        self.shared
            .last_message_at_ms
            .store(unix_millis_now(), Ordering::Relaxed);

        let message = Message::new(parsed, slot, self.requests_tx.clone(), timing);
        match &self.message_sink {
            Some(sink) => {
                if sink.send(message).await.is_err() {
                    debug!("message sink closed, releasing {id}");
                    self.inflight.remove(&id);
                    self.shared
                        .inflight_count
                        .store(self.inflight.len(), Ordering::Relaxed);
                }
            }
            None => {
                debug!("MESSAGE frame on a connection with no consumer, releasing {id}");
                self.inflight.remove(&id);
                self.shared
                    .inflight_count
                    .store(self.inflight.len(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Starts the close protocol: CLS when subscribed, then wait for the
    /// inflight map to empty (bounded by `msg_timeout`), then drain the
    /// queue and half-close.
    fn begin_close(&mut self, done: Option<oneshot::Sender<Result<(), NsqError>>>) {
        if let Some(close) = &mut self.close {
            close.done.extend(done);
            return;
        }

        let abortive = self.shared.abortive_close.load(Ordering::Relaxed);
        let deadline = if abortive {
            // An unref'd connection does not wait for inflight work.
            self.inflight.clear();
            self.shared.inflight_count.store(0, Ordering::Relaxed);
            self.reject_queued(&NsqError::Terminated);
            Instant::now()
        } else {
            if self.subscription.is_some() {
                self.queue.push_back(Envelope {
                    command: Command::Cls,
                    reply: None,
                });
            }
            Instant::now() + self.message_timing().msg_timeout
        };

        info!(
            "closing connection to {} ({} inflight, {} queued)",
            self.address,
            self.inflight.len(),
            self.queue.len()
        );
        self.close = Some(CloseRequest {
            done: done.into_iter().collect(),
            deadline,
        });
    }

    fn close_complete(&self) -> bool {
        self.close.is_some()
            && self.queue.is_empty()
            && self.pending.is_none()
            && self.inflight.is_empty()
    }

    /// Both drains are done: half-close the socket, wait briefly for the
    /// server's FIN, and resolve the close waiters.
    async fn finish_close(
        &mut self,
        frames: &mut FramedRead<OwnedReadHalf, NsqCodec>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<ServeExit, NsqError> {
        self.transition(ConnectionState::Closing);
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown of {} failed: {e}", self.address);
        }

        let drain = async {
            while let Some(result) = frames.next().await {
                if result.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("server at {} did not close within {CLOSE_DRAIN_TIMEOUT:?}", self.address);
        }

        self.transition(ConnectionState::Closed);
        self.emit(ConnectionEvent::Closed);
        if let Some(close) = self.close.take() {
            for done in close.done {
                let _ = done.send(Ok(()));
            }
        }
        info!("connection to {} closed", self.address);
        Ok(ServeExit::Closed)
    }

    /// Cleanup after an unexpected socket loss.
    fn on_disconnect(&mut self) {
        let lost: NsqError = std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection lost before the response arrived",
        )
        .into();
        self.fail_pending(&lost);
        self.inflight.clear();
        self.shared.inflight_count.store(0, Ordering::Relaxed);
        self.emit(ConnectionEvent::Disconnected);
        self.transition(ConnectionState::Disconnected);
    }

    /// Reconnect attempts exhausted: reject everything and go terminal.
    fn fail_terminal(&mut self) {
        error!(
            "giving up on {} after {} attempts",
            self.address, self.config.max_connect_attempts
        );
        self.fail_pending(&NsqError::Terminated);
        self.reject_queued(&NsqError::Terminated);
        self.emit(ConnectionEvent::Error(NsqError::MaxReconnectsExceeded));
        self.emit(ConnectionEvent::Failed);
        self.emit(ConnectionEvent::Closed);
        self.transition(ConnectionState::Failed);
    }

    fn fail_pending(&mut self, err: &NsqError) {
        if let Some(pending) = self.pending.take() {
            debug!("rejecting outstanding {} on {}", pending.name, self.address);
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    fn reject_queued(&mut self, err: &NsqError) {
        for envelope in self.queue.drain(..) {
            if let Some(reply) = envelope.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    fn identify_payload(&self) -> serde_json::Value {
        let hostname = self
            .config
            .hostname
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string());
        let client_id = self.config.client_id.clone().unwrap_or_else(|| hostname.clone());

        let mut payload = serde_json::json!({
            "feature_negotiation": true,
            "user_agent": self.config.user_agent,
            "hostname": hostname,
            "client_id": client_id,
        });
        if let (Some(map), Some(timeout)) = (payload.as_object_mut(), self.config.msg_timeout_ms) {
            map.insert("msg_timeout".into(), serde_json::json!(timeout));
        }
        payload
    }

    fn message_timing(&self) -> MessageTiming {
        let features = self.shared.features.lock();
        let (msg_timeout, max_msg_timeout) = features
            .as_ref()
            .map(|f| (f.msg_timeout, f.max_msg_timeout))
            .unwrap_or((DEFAULT_MSG_TIMEOUT_MS, DEFAULT_MAX_MSG_TIMEOUT_MS));
        MessageTiming {
            msg_timeout: Duration::from_millis(msg_timeout),
            max_msg_timeout: Duration::from_millis(max_msg_timeout),
            keepalive_offset: self.keepalive_offset,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(observer) = &self.observer {
            let host_event = HostEvent {
                host: self.address.host.clone(),
                port: self.address.port,
                event: event.clone(),
            };
            if observer.try_send(host_event).is_err() {
                debug!("observer for {} is not keeping up", self.address);
            }
        }
        let _ = self.events.send(event);
    }

    fn transition(&self, next: ConnectionState) {
        let current = *self.status.borrow();
        if current != next {
            debug!("connection {} state {current} -> {next}", self.address);
            self.status.send_replace(next);
        }
    }

    /// Moves between the established sub-states (`Ready`/`Pulsing`/`Paused`)
    /// without disturbing handshake or teardown states.
    fn transition_established(&self, next: ConnectionState) {
        if self.status.borrow().is_established() {
            self.transition(next);
        }
    }

    /// After pulsing or an RDY change, settle back to `Paused` or `Ready`.
    fn restore_established_state(&self) {
        if self.subscription.is_some() && self.last_ready == 0 {
            self.transition_established(ConnectionState::Paused);
        } else {
            self.transition_established(ConnectionState::Ready);
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
