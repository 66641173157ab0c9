// src/core/message.rs

//! An inbound NSQ message and its disposition handles.
//!
//! A `Message` keeps a non-owning channel back to the connection that
//! delivered it; FIN/REQ/TOUCH are submitted through that channel and fail
//! with [`NsqError::Terminated`] once the connection is gone.

use crate::connection::actor::ActorRequest;
use crate::connection::inflight::InflightSlot;
use crate::core::NsqError;
use crate::core::protocol::Command;
use bytes::{Buf, Bytes};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

const TIMESTAMP_LEN: usize = 8;
const ATTEMPTS_LEN: usize = 2;
const ID_LEN: usize = 16;
const HEADER_LEN: usize = TIMESTAMP_LEN + ATTEMPTS_LEN + ID_LEN;

/// The 16-byte ASCII message identifier assigned by nsqd.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MessageId {
    type Error = NsqError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let id: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| NsqError::Protocol(format!("message id must be {ID_LEN} bytes")))?;
        Ok(MessageId(id))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// The decoded fields of a MESSAGE frame body:
/// `[8-byte BE ns timestamp][2-byte BE attempts][16-byte id][body]`.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub id: MessageId,
    pub attempts: u16,
    pub timestamp_ns: u64,
    pub body: Bytes,
}

impl ParsedMessage {
    pub fn parse(mut body: Bytes) -> Result<Self, NsqError> {
        if body.len() < HEADER_LEN {
            return Err(NsqError::Protocol(format!(
                "MESSAGE frame body of {} bytes is shorter than the {HEADER_LEN} byte header",
                body.len()
            )));
        }
        let timestamp_ns = body.get_u64();
        let attempts = body.get_u16();
        let id = MessageId::try_from(&body.split_to(ID_LEN)[..])?;
        Ok(ParsedMessage {
            id,
            attempts,
            timestamp_ns,
            body,
        })
    }
}

/// Timing parameters a message inherits from its connection's negotiated
/// features and configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MessageTiming {
    pub msg_timeout: Duration,
    pub max_msg_timeout: Duration,
    pub keepalive_offset: Duration,
}

/// A message delivered by nsqd, pending FIN/REQ/timeout.
///
/// While the message is alive it occupies a slot in its connection's
/// inflight map; `finish`/`requeue` release the slot, `touch` extends its
/// deadline, and letting the deadline lapse hands the redelivery decision
/// back to the server.
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    attempts: u16,
    timestamp_ns: u64,
    received_at: Instant,
    body: Bytes,
    slot: Arc<InflightSlot>,
    requests: mpsc::Sender<ActorRequest>,
    timing: MessageTiming,
}

impl Message {
    pub(crate) fn new(
        parsed: ParsedMessage,
        slot: Arc<InflightSlot>,
        requests: mpsc::Sender<ActorRequest>,
        timing: MessageTiming,
    ) -> Self {
        Message {
            id: parsed.id,
            attempts: parsed.attempts,
            timestamp_ns: parsed.timestamp_ns,
            received_at: Instant::now(),
            body: parsed.body,
            slot,
            requests,
            timing,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// How many times nsqd has attempted delivery, this one included.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// When nsqd first accepted the message.
    pub fn published_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.timestamp_ns)
    }

    /// When this client received the message.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The raw message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// An opportunistic JSON view of the body. `None` when the body is not
    /// valid JSON; the raw bytes stay available either way.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Time left before the client-side inflight deadline lapses and the
    /// entry is silently dropped (the server requeues independently).
    pub fn expires_in(&self) -> Duration {
        let deadline = *self.slot.deadline.lock();
        deadline.saturating_duration_since(Instant::now())
    }

    /// True once FIN or REQ completed for this message.
    pub fn is_finished(&self) -> bool {
        self.slot.finished.load(Ordering::Acquire)
    }

    /// Acknowledges successful processing (FIN). Consumes the message and
    /// resolves once the command is on the wire.
    pub async fn finish(self) -> Result<(), NsqError> {
        self.dispatch(Command::Fin(self.id)).await
    }

    /// Returns the message to the queue (REQ), optionally after a delay.
    pub async fn requeue(self, delay: Option<Duration>) -> Result<(), NsqError> {
        let delay_ms = delay.map_or(0, |d| d.as_millis() as u64);
        self.dispatch(Command::Req {
            id: self.id,
            delay_ms,
        })
        .await
    }

    /// Resets the server- and client-side timeout for this message (TOUCH).
    pub async fn touch(&self) -> Result<(), NsqError> {
        self.dispatch(Command::Touch(self.id)).await
    }

    /// Spawns a task that keeps TOUCHing this message shortly before each
    /// deadline, stopping when the message finishes or the total lifetime
    /// reaches the negotiated `max_msg_timeout`. The returned handle can be
    /// aborted to stop early.
    pub fn keepalive(&self) -> tokio::task::JoinHandle<()> {
        let id = self.id;
        let slot = Arc::clone(&self.slot);
        let requests = self.requests.clone();
        let timing = self.timing;
        let received_at = self.received_at;

        tokio::spawn(async move {
            loop {
                let deadline = *slot.deadline.lock();
                // An offset at or beyond msg_timeout would schedule the
                // TOUCH in the past; fall back to half the timeout.
                let mut touch_at = deadline
                    .checked_sub(timing.keepalive_offset)
                    .unwrap_or_else(Instant::now);
                let floor = Instant::now() + timing.msg_timeout / 2;
                if touch_at < floor && deadline > floor {
                    touch_at = floor;
                }
                tokio::time::sleep_until(touch_at).await;

                // A concurrent manual touch may have pushed the deadline out
                // while we slept; re-arm instead of touching early.
                if *slot.deadline.lock() > deadline {
                    continue;
                }
                if slot.finished.load(Ordering::Acquire) {
                    break;
                }
                if received_at.elapsed() + timing.msg_timeout >= timing.max_msg_timeout {
                    debug!("keepalive for {id} reached max_msg_timeout, stopping");
                    break;
                }

                let (reply, done) = oneshot::channel();
                let submit = ActorRequest::Submit {
                    command: Command::Touch(id),
                    reply,
                };
                if requests.send(submit).await.is_err() {
                    break;
                }
                match done.await {
                    Ok(Ok(_)) => {}
                    _ => break,
                }
            }
        })
    }

    async fn dispatch(&self, command: Command) -> Result<(), NsqError> {
        let (reply, done) = oneshot::channel();
        self.requests
            .send(ActorRequest::Submit { command, reply })
            .await
            .map_err(|_| NsqError::Terminated)?;
        done.await.map_err(|_| NsqError::Terminated)?.map(|_| ())
    }
}
