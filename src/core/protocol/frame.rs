// src/core/protocol/frame.rs

//! Implements the NSQ v2 frame structure and the corresponding streaming
//! `Decoder` for network communication.
//!
//! Frames on the wire are `[4-byte BE size][4-byte BE type][body]`, where
//! `size` covers the type tag plus the body.

use crate::core::NsqError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// The four-byte protocol identifier written once per fresh TCP connection,
/// before the first IDENTIFY.
pub const MAGIC_V2: &[u8] = b"  V2";

/// The body of the periodic RESPONSE frame nsqd uses as a liveness probe.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

const FRAME_SIZE_LEN: usize = 4;
const FRAME_TYPE_LEN: usize = 4;

// Protocol-level limit to prevent unbounded allocation from a malformed or
// malicious size prefix. nsqd's own --max-msg-size defaults to 1MB.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// An enum representing a single inbound frame in the NSQ protocol.
/// This is the low-level representation of data received from nsqd.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Bytes),
}

impl Frame {
    /// True when this frame is the server's heartbeat probe, which must be
    /// answered with a `NOP`.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_ref() == HEARTBEAT)
    }
}

/// A `tokio_util::codec` implementation for deframing the inbound NSQ byte
/// stream. Outbound command encoding lives on the same codec, see
/// `protocol::command`.
#[derive(Debug, Default)]
pub struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = NsqError;

    /// Decodes a single frame from a `BytesMut` buffer.
    ///
    /// It returns `Ok(None)` while the buffer holds only a partial frame,
    /// allowing the `FramedRead` stream to wait for more data from the
    /// network. Framing violations are fatal and propagate up to the
    /// connection actor, which tears the socket down.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src) {
            Ok((frame, len)) => {
                // Advance the buffer past the successfully parsed frame.
                src.advance(len);
                Ok(Some(frame))
            }
            // If the data is incomplete, wait for more.
            Err(NsqError::IncompleteFrame) => Ok(None),
            // Other errors propagate up to the connection actor.
            Err(e) => Err(e),
        }
    }
}

/// Parses one frame from the front of the buffer, returning it along with
/// the number of bytes it occupies.
fn parse_frame(src: &[u8]) -> Result<(Frame, usize), NsqError> {
    if src.len() < FRAME_SIZE_LEN {
        return Err(NsqError::IncompleteFrame);
    }

    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if size < FRAME_TYPE_LEN {
        return Err(NsqError::Protocol(format!(
            "frame size {size} is smaller than the type tag"
        )));
    }
    if size > MAX_FRAME_SIZE {
        return Err(NsqError::Protocol(format!(
            "frame size {size} exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    if src.len() < FRAME_SIZE_LEN + size {
        return Err(NsqError::IncompleteFrame);
    }

    let frame_type = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
    let body_start = FRAME_SIZE_LEN + FRAME_TYPE_LEN;
    let body = Bytes::copy_from_slice(&src[body_start..FRAME_SIZE_LEN + size]);
    let consumed = FRAME_SIZE_LEN + size;

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok((Frame::Response(body), consumed)),
        FRAME_TYPE_ERROR => Ok((Frame::Error(body), consumed)),
        FRAME_TYPE_MESSAGE => Ok((Frame::Message(body), consumed)),
        other => Err(NsqError::Protocol(format!("unknown frame type {other}"))),
    }
}
