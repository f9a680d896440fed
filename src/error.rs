use thiserror::Error;

/// Failures that are reported to the caller of a send or setup operation. Everything that
///  originates from the network is handled inside the tick functions and never shows up here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("ring buffer is full")]
    BufferFull,

    #[error("maximum number of reliable packets in send buffer reached")]
    QueueFull,

    #[error("message of {size} bytes exceeds maximum size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection is not connected")]
    NotConnected,

    #[error("no connection for this end point")]
    UnknownConnection,

    #[error("peer is not active")]
    PeerNotActive,
}

impl TransportError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> TransportError {
        TransportError::InvalidArgument { name, reason: reason.into() }
    }
}
