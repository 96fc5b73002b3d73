//! Stream Multiplexer Protocol Definitions
//!
//! This crate defines the wire frame and the codec used by every stream
//! multiplexed over a single smux connection.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Command, Frame, FrameError, StreamId};

/// Protocol version carried in every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single frame can carry (the length field is 16 bits)
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Stream ID used by session-level frames such as keepalives
pub const SESSION_STREAM_ID: StreamId = 0;
