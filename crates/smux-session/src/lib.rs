//! Stream multiplexing over a single connection
//!
//! A [`Session`] owns one connection and routes frames to many [`Stream`]s.
//! Each stream is a bidirectional byte channel identified by a numeric id.

pub mod config;
pub mod error;
pub mod session;
pub mod stream;

pub use config::{Config, ConfigError};
pub use error::{SessionError, StreamError};
pub use session::Session;
pub use stream::{Stream, StreamHost};

pub use smux_proto::{Command, Frame, StreamId};
