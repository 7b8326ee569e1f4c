//! Error types for ringlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("invalid layout: {0}")]
    Layout(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("malformed connection descriptor: {0}")]
    Parse(String),

    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("ring channel full: packet needs {required} bytes, {free} free")]
    RingFull { required: usize, free: usize },

    #[error("receive buffer too small: packet needs {required} bytes")]
    BufferTooSmall { required: usize },

    #[error("failed to spawn node: {0}")]
    Spawn(String),

    #[error("node not found: {0}")]
    NodeNotFound(u32),

    #[error("link closed")]
    LinkClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller can retry the same operation later
    ///
    /// A full ring drains as the peer consumes; a short receive buffer
    /// leaves the packet in place for a retry with a bigger one.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RingFull { .. } | Error::BufferTooSmall { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
