//! Protocol constants.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed. Timing and
//! sizing values are defaults; sockets may override them through their
//! configuration.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// First byte of every packet.
pub const MAGIC: u8 = 0xFF;

/// Wire format version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Packet header size (magic + version + flags + reserved + id + seq + ack).
pub const HEADER_SIZE: usize = 16;

/// Largest datagram we will ever read.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Recommended max payload so a packet fits a typical path MTU.
pub const DEFAULT_MAX_PAYLOAD: usize = 1180;

// =============================================================================
// PACKET FLAGS
// =============================================================================

/// Ordered stream data.
pub const FLAG_DATA: u8 = 0x01;

/// End of the ordered stream (occupies one sequence number).
pub const FLAG_END: u8 = 0x02;

/// Unordered reliable message.
pub const FLAG_MESSAGE: u8 = 0x04;

/// Sender destroyed its stream.
pub const FLAG_DESTROY: u8 = 0x08;

/// Acknowledges the message whose sequence is carried in `seq`.
pub const FLAG_MESSAGE_ACK: u8 = 0x10;

// =============================================================================
// TIMING
// =============================================================================

/// Initial retransmission timeout before the first RTT sample.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(30);

/// Retransmissions of one packet before the stream times out.
pub const MAX_RETRANSMITS: u32 = 10;

/// Retransmit backoff multiplier.
pub const RETRANSMIT_BACKOFF: u32 = 2;

/// How long a closing socket waits for live streams before forcing them.
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// BUFFERS
// =============================================================================

/// Out-of-order segments held per stream.
pub const REORDER_CAPACITY: usize = 1024;

/// Message sequence numbers remembered for duplicate suppression.
pub const DUPLICATE_WINDOW_SIZE: usize = 2048;

/// Recently closed routing ids remembered per socket.
pub const TOMBSTONE_CAPACITY: usize = 64;
