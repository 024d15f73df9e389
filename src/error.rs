//! Error types for the audio relay

use thiserror::Error;

use crate::network::PeerAddress;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sample ring errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Ring capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Read from an empty ring")]
    Empty,
}

/// Frame parsing and building errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes, expected at least {expected}")]
    TooShort { len: usize, expected: usize },

    #[error("Checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("Invalid frame layout: {0}")]
    InvalidLayout(String),
}

/// Link-layer errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No buffer space available")]
    NoBufferSpace,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerAddress),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Socket bind failed: {0}")]
    Bind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// A transient failure is retried with the same frame; anything else
    /// tears the sender down.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::NoBufferSpace)
    }
}

/// Event queue errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue full")]
    Full,

    #[error("Receive buffer pool exhausted")]
    PoolExhausted,

    #[error("Received frame too large: {0} bytes")]
    Oversize(usize),

    #[error("Event queue closed")]
    Closed,
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
