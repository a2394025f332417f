//! Error types for gridboot-discovery.

use thiserror::Error;

use crate::framing::FrameError;

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering the grid.
#[derive(Debug, Error)]
pub enum Error {
    /// Registry state could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] gridboot_registry::Error),

    /// A datagram failed frame validation.
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// Every identifier in the grid is already claimed.
    #[error("the grid is full, no identifier is free for another node")]
    GridFull,

    /// Discovery was shut down before an identifier was claimed.
    #[error("discovery has been aborted")]
    Aborted,

    /// `discover` was called on a node that already ran discovery.
    #[error("discovery already ran on this node")]
    AlreadyDiscovered,

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
