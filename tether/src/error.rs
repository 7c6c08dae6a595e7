//! Error types for the tether transport.
//!
//! Only calls made by the application can fail with a [`TetherError`].
//! Problems found while processing network input are logged and dropped, or
//! surfaced as events.

use thiserror::Error;

/// Result type for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

#[derive(Debug, Error)]
pub enum TetherError {
    /// I/O error from the socket collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager has not been started, or was stopped.
    #[error("Transport is not running")]
    NotRunning,

    /// `start` called twice.
    #[error("Transport is already running")]
    AlreadyRunning,

    /// Send attempted on a peer that is not connected.
    #[error("Peer is not connected")]
    NotConnected,

    /// A reliable message would need more fragments than allowed.
    #[error("Message needs {required} fragments, limit is {max}")]
    TooManyFragments { required: usize, max: usize },

    /// Payload does not fit one datagram on a method that cannot fragment.
    #[error("Payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Channel number outside the configured channel count.
    #[error("Channel {number} out of range (channels: {max})")]
    InvalidChannel { number: u8, max: u8 },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Feature switched off in the configuration.
    #[error("{0} is disabled in the configuration")]
    Disabled(&'static str),
}

impl TetherError {
    /// Create a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
