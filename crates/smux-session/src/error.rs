//! Session and stream errors

use crate::config::ConfigError;
use smux_proto::FrameError;
use std::io;
use thiserror::Error;

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    #[error("No available stream IDs")]
    StreamIdsExhausted,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors surfaced by [`Stream`](crate::Stream) operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream was closed locally or its session went away
    #[error("Broken pipe")]
    BrokenPipe,

    /// The peer reset the stream
    #[error("End of stream")]
    EndOfStream,

    /// A frame could not be written.
    ///
    /// The write counts as failed as a whole, but `flushed` bytes from earlier
    /// frames of the same call had already been handed to the connection.
    #[error("Write failed after {flushed} bytes: {source}")]
    WriteFailure {
        flushed: usize,
        #[source]
        source: SessionError,
    },
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::BrokenPipe => io::ErrorKind::BrokenPipe,
            StreamError::EndOfStream => io::ErrorKind::UnexpectedEof,
            StreamError::WriteFailure { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
