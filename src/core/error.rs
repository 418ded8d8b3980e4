//! Error types shared by every layer.

use thiserror::Error;

/// Errors that can occur when decoding a packet.
///
/// Packets arrive from an untrusted network; every variant is handled by
/// dropping the packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet is shorter than the fixed header.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// First byte is not the protocol magic.
    #[error("bad magic byte: 0x{0:02x}")]
    BadMagic(u8),

    /// Unsupported wire version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Reserved header byte is not zero.
    #[error("reserved byte must be zero, got 0x{0:02x}")]
    Reserved(u8),

    /// Unknown bits or more than one kind bit set.
    #[error("invalid flags: 0x{0:02x}")]
    InvalidFlags(u8),

    /// A packet kind that never carries data arrived with a payload.
    #[error("unexpected {0}-byte payload on a control packet")]
    UnexpectedPayload(usize),
}
