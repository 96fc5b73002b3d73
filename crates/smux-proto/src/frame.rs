//! Frame layout for the multiplexed connection

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Open a new stream
    Syn = 0,
    /// Reset / close a stream
    Fin = 1,
    /// Push stream payload
    Psh = 2,
    /// Keepalive, no stream attached
    Nop = 3,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Syn),
            1 => Ok(Command::Fin),
            2 => Ok(Command::Psh),
            3 => Ok(Command::Nop),
            _ => Err(FrameError::InvalidCommand(value)),
        }
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Command,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: version (1) + cmd (1) + length (2) + stream_id (4) = 8 bytes
    pub const HEADER_SIZE: usize = 8;

    pub fn new(cmd: Command, stream_id: StreamId) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            cmd,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn syn(stream_id: StreamId) -> Self {
        Self::new(Command::Syn, stream_id)
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(Command::Fin, stream_id)
    }

    pub fn psh(stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::new(Command::Psh, stream_id)
        }
    }

    pub fn nop() -> Self {
        Self::new(Command::Nop, crate::SESSION_STREAM_ID)
    }

    /// Total encoded length of this frame
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Encode frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(self.version);
        buf.put_u8(self.cmd as u8);
        buf.put_u16_le(payload_len as u16);
        buf.put_u32_le(self.stream_id);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns Ok(Some(frame)) if a complete frame was decoded and consumed,
    /// Ok(None) if more data is needed (nothing is consumed),
    /// Err if the header is malformed
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let version = buf[0];
        if version != crate::PROTOCOL_VERSION {
            return Err(FrameError::InvalidVersion(version));
        }
        let cmd = Command::try_from(buf[1])?;
        let length = u16::from_le_bytes([buf[2], buf[3]]) as usize;

        if buf.len() < Self::HEADER_SIZE + length {
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        let mut header = buf.split_to(Self::HEADER_SIZE);
        header.advance(4);
        let stream_id = header.get_u32_le();
        let payload = buf.split_to(length).freeze();

        Ok(Some(Self {
            version,
            cmd,
            stream_id,
            payload,
        }))
    }
}
