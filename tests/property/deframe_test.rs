// tests/property/deframe_test.rs

//! The streaming deframer must produce identical frames no matter how the
//! byte stream is chunked.

use bytes::BytesMut;
use nsq_client::core::protocol::{Frame, NsqCodec};
use proptest::prelude::*;
use tokio_util::codec::Decoder;

fn encode_frames(frames: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut wire = Vec::new();
    for (frame_type, body) in frames {
        wire.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
        wire.extend_from_slice(&frame_type.to_be_bytes());
        wire.extend_from_slice(body);
    }
    wire
}

fn decode_chunked(chunks: &[&[u8]]) -> Vec<Frame> {
    let mut codec = NsqCodec;
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(frame) = codec.decode(&mut buf).expect("valid input must decode") {
            decoded.push(frame);
        }
    }
    decoded
}

proptest! {
    #[test]
    fn deframing_is_split_invariant(
        frames in prop::collection::vec(
            (0u32..3, prop::collection::vec(any::<u8>(), 0..64)),
            1..8,
        ),
        split in any::<prop::sample::Index>(),
    ) {
        let wire = encode_frames(&frames);

        let whole = decode_chunked(&[&wire]);
        prop_assert_eq!(whole.len(), frames.len());

        let at = split.index(wire.len() + 1);
        let halves = decode_chunked(&[&wire[..at], &wire[at..]]);
        prop_assert_eq!(&whole, &halves);

        let bytewise: Vec<&[u8]> = wire.chunks(1).collect();
        let trickled = decode_chunked(&bytewise);
        prop_assert_eq!(&whole, &trickled);
    }
}
