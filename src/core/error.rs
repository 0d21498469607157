//! Error handling - Hierarchical errors for the gateway and the workers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem / OS errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker type outside the worker table
    #[error("unsupported broker type: {0}")]
    UnsupportedBroker(String),

    /// Channel name that cannot live in the bus directory
    #[error("invalid channel name: {0}")]
    ChannelName(String),

    /// Mapped file does not carry a channel header we understand
    #[error("corrupt channel {0}")]
    ChannelCorrupt(String),

    /// Bounded channel has no free slot
    #[error("channel {0} is full")]
    ChannelFull(String),

    /// Frame larger than the channel record size
    #[error("frame of {len} bytes exceeds channel limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// WebSocket front end errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Worker process could not be launched
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
