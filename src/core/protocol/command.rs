// src/core/protocol/command.rs

//! Outbound command encoding for NSQ protocol v2.
//!
//! Commands are newline-terminated ASCII command lines optionally followed
//! by length-prefixed bodies; `MPUB` carries its own counted envelope.

use super::frame::NsqCodec;
use crate::core::NsqError;
use crate::core::message::MessageId;
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

/// An outbound command destined for nsqd.
#[derive(Debug, Clone)]
pub enum Command {
    /// Feature negotiation; the body is the JSON identify payload.
    Identify(serde_json::Value),
    /// Authentication secret, sent when the negotiated features require it.
    Auth(Bytes),
    Sub {
        topic: String,
        channel: String,
    },
    Pub {
        topic: String,
        body: MessageBody,
    },
    Dpub {
        topic: String,
        delay_ms: u64,
        body: MessageBody,
    },
    Mpub {
        topic: String,
        bodies: Vec<MessageBody>,
    },
    Rdy(u64),
    Fin(MessageId),
    Req {
        id: MessageId,
        delay_ms: u64,
    },
    Touch(MessageId),
    Cls,
    Nop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Auth(_) => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Pub { .. } => "PUB",
            Command::Dpub { .. } => "DPUB",
            Command::Mpub { .. } => "MPUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
        }
    }

    /// True when nsqd answers this command with a RESPONSE (or ERROR) frame.
    /// Such a command occupies the connection's single waiter slot until its
    /// reply arrives.
    pub fn needs_response(&self) -> bool {
        matches!(
            self,
            Command::Identify(_)
                | Command::Auth(_)
                | Command::Sub { .. }
                | Command::Pub { .. }
                | Command::Dpub { .. }
                | Command::Mpub { .. }
                | Command::Cls
        )
    }

    /// Encodes the command into `dst` according to the NSQ v2 wire format.
    pub fn encode_to(&self, dst: &mut BytesMut) -> Result<(), NsqError> {
        match self {
            Command::Identify(payload) => {
                dst.put_slice(b"IDENTIFY\n");
                put_counted_body(dst, &serde_json::to_vec(payload)?);
            }
            Command::Auth(secret) => {
                dst.put_slice(b"AUTH\n");
                put_counted_body(dst, secret);
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Pub { topic, body } => {
                dst.put_slice(format!("PUB {topic}\n").as_bytes());
                put_counted_body(dst, &body.to_bytes()?);
            }
            Command::Dpub {
                topic,
                delay_ms,
                body,
            } => {
                dst.put_slice(format!("DPUB {topic} {delay_ms}\n").as_bytes());
                put_counted_body(dst, &body.to_bytes()?);
            }
            Command::Mpub { topic, bodies } => {
                dst.put_slice(format!("MPUB {topic}\n").as_bytes());
                let encoded: Vec<Bytes> = bodies
                    .iter()
                    .map(|b| b.to_bytes())
                    .collect::<Result<_, _>>()?;
                // The outer size covers the message count plus every
                // length-prefixed body.
                let total: usize = 4 + encoded.iter().map(|b| 4 + b.len()).sum::<usize>();
                dst.put_u32(total as u32);
                dst.put_u32(encoded.len() as u32);
                for body in &encoded {
                    put_counted_body(dst, body);
                }
            }
            Command::Rdy(count) => {
                dst.put_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                dst.put_slice(format!("FIN {id}\n").as_bytes());
            }
            Command::Req { id, delay_ms } => {
                dst.put_slice(format!("REQ {id} {delay_ms}\n").as_bytes());
            }
            Command::Touch(id) => {
                dst.put_slice(format!("TOUCH {id}\n").as_bytes());
            }
            Command::Cls => dst.put_slice(b"CLS\n"),
            Command::Nop => dst.put_slice(b"NOP\n"),
        }
        Ok(())
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = NsqError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_to(dst)
    }
}

/// Writes a `[4-byte BE length][body]` segment.
fn put_counted_body(dst: &mut BytesMut, body: &[u8]) {
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

/// A publish payload before wire encoding.
///
/// Raw byte buffers are used verbatim, strings as UTF-8, JSON values are
/// serde-encoded, and numeric scalars are stringified.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Raw(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl MessageBody {
    /// Coerces the payload into its wire bytes.
    pub fn to_bytes(&self) -> Result<Bytes, NsqError> {
        match self {
            MessageBody::Raw(bytes) => Ok(bytes.clone()),
            MessageBody::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            MessageBody::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }
}

impl From<Bytes> for MessageBody {
    fn from(bytes: Bytes) -> Self {
        MessageBody::Raw(bytes)
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        MessageBody::Raw(Bytes::from(bytes))
    }
}

impl From<&[u8]> for MessageBody {
    fn from(bytes: &[u8]) -> Self {
        MessageBody::Raw(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        MessageBody::Text(text)
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        MessageBody::Text(text.to_string())
    }
}

impl From<serde_json::Value> for MessageBody {
    fn from(value: serde_json::Value) -> Self {
        MessageBody::Json(value)
    }
}

impl From<i64> for MessageBody {
    fn from(n: i64) -> Self {
        MessageBody::Text(n.to_string())
    }
}

impl From<u64> for MessageBody {
    fn from(n: u64) -> Self {
        MessageBody::Text(n.to_string())
    }
}

impl From<f64> for MessageBody {
    fn from(n: f64) -> Self {
        MessageBody::Text(n.to_string())
    }
}
