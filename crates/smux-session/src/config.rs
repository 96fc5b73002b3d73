//! Session configuration

use smux_proto::MAX_PAYLOAD_SIZE;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by [`Config::verify`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Keepalive interval must be positive")]
    ZeroKeepaliveInterval,

    #[error("Keepalive timeout must be positive")]
    ZeroKeepaliveTimeout,

    #[error("Keepalive interval {interval:?} exceeds timeout {timeout:?}")]
    KeepaliveIntervalTooLong {
        interval: Duration,
        timeout: Duration,
    },

    #[error("Max frame size must be between 1 and {max}, got {got}")]
    InvalidFrameSize { got: usize, max: usize },

    #[error("Accept backlog must be positive")]
    ZeroAcceptBacklog,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version the session speaks; only `smux_proto::PROTOCOL_VERSION` is accepted
    pub version: u8,
    /// How often a keepalive frame is sent
    pub keepalive_interval: Duration,
    /// Session is closed if nothing arrives within this window
    pub keepalive_timeout: Duration,
    /// Upper bound on the payload of each outbound data frame
    pub max_frame_size: usize,
    /// Number of peer-opened streams that may wait for `accept_stream`
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: smux_proto::PROTOCOL_VERSION,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            max_frame_size: 4096,
            accept_backlog: 1024,
        }
    }
}

impl Config {
    /// Check the configuration before a session is built from it
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.version != smux_proto::PROTOCOL_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::ZeroKeepaliveInterval);
        }
        if self.keepalive_timeout.is_zero() {
            return Err(ConfigError::ZeroKeepaliveTimeout);
        }
        if self.keepalive_timeout < self.keepalive_interval {
            return Err(ConfigError::KeepaliveIntervalTooLong {
                interval: self.keepalive_interval,
                timeout: self.keepalive_timeout,
            });
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::InvalidFrameSize {
                got: self.max_frame_size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.accept_backlog == 0 {
            return Err(ConfigError::ZeroAcceptBacklog);
        }
        Ok(())
    }
}
