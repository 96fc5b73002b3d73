//! Codec for reading and writing frames on a byte stream

use crate::frame::{Frame, FrameError};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Frame codec for use with `FramedRead` / `FramedWrite`
///
/// Format: [version: u8][cmd: u8][length: u16 LE][stream_id: u32 LE][payload]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let frame = Frame::decode(src)?;
        if let Some(frame) = &frame {
            trace!(
                "Decoded frame: stream_id={}, cmd={:?}, size={}",
                frame.stream_id,
                frame.cmd,
                frame.payload.len()
            );
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst)
    }
}
