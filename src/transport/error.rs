//! Transport layer error types.
//!
//! [`TransportError`] is returned synchronously to the caller that misused an
//! API. [`StreamError`] is terminal for a stream and is delivered through
//! [`StreamEvent::Error`](super::StreamEvent::Error) right before the stream
//! closes. Malformed and duplicate packets never produce either.

use std::io;

use thiserror::Error;

/// Errors returned directly from socket and stream calls.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// `connect` called on a stream that is already connected.
    #[error("stream already connected")]
    AlreadyConnected,

    /// Operation requires a connected stream.
    #[error("stream not connected")]
    NotConnected,

    /// `write` after `end`.
    #[error("write after end")]
    WriteAfterEnd,

    /// The stream has been destroyed or has closed.
    #[error("stream destroyed")]
    Destroyed,

    /// Message does not fit in a single packet.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Largest payload a packet may carry.
        max: usize,
    },

    /// The socket is closing or closed.
    #[error("socket closed")]
    SocketClosed,
}

impl TransportError {
    /// Check if this error means the stream can never be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Destroyed | TransportError::SocketClosed
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Terminal stream failures surfaced as events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A packet went unacknowledged through the whole retransmit budget.
    #[error("stream timed out after {retransmits} retransmissions")]
    Timeout {
        /// Retransmissions attempted for the packet that gave up.
        retransmits: u32,
    },

    /// The peer destroyed its stream before ending it.
    #[error("stream reset by peer")]
    PeerReset,

    /// The owning socket shut down while the stream was still open.
    #[error("socket closed")]
    SocketClosed,

    /// Another stream on the socket already uses this routing id.
    #[error("routing id {0} already in use")]
    IdInUse(u32),

    /// The stream was destroyed locally before a write was acknowledged.
    #[error("stream destroyed before the write was acknowledged")]
    Aborted,

    /// Application supplied error passed to `destroy_with`.
    #[error("{0}")]
    Custom(String),
}

impl StreamError {
    /// Check if the failure originated on the remote side or the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, StreamError::Timeout { .. } | StreamError::PeerReset)
    }
}
