//! Stream transport over a shared UDP socket.
//!
//! This module implements the reliable half of the crate on top of the
//! [`core`](crate::core) packet codec. It provides:
//!
//! - **Sockets**: [`Socket`] owns one UDP endpoint and routes packets by id
//! - **Streams**: [`Stream`] is an ordered byte stream plus unordered messages
//! - **Reliability**: [`RetransmitQueue`] with [`RttEstimator`] driven timeouts
//! - **Reordering**: [`ReorderBuffer`] and [`SeqWindow`] on the receive side
//! - **State machine**: [`Connection`], the sans-I/O core of one stream
//!
//! # Architecture
//!
//! Every socket runs one task that owns the UDP endpoint and the routing
//! table. Handles talk to it over channels, so no lock is held across I/O.
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐
//! │ Stream (id 1)│  │ Stream (id 2)│   application handles
//! └──────┬───────┘  └──────┬───────┘
//!        │ commands ▲ events
//! ┌──────▼─────────────────▼────────┐
//! │          socket task            │  ← routing, timers, flush
//! │   Connection  Connection  ...   │
//! ├─────────────────────────────────┤
//! │              UDP                │
//! └─────────────────────────────────┘
//! ```

mod ack;
mod connection;
mod error;
mod reorder;
mod socket;
mod stream;
mod timing;
mod window;

pub use ack::{Pending, RetransmitPoll, RetransmitQueue};
pub use connection::{Connection, StreamPhase, WriteNotify};
pub use error::*;
pub use reorder::{InsertOutcome, ReorderBuffer, Segment};
pub use socket::{Preconnect, Socket, SocketBuilder, SocketConfig, SocketStats};
pub use stream::{Stream, StreamEvent, WriteAck};
pub use timing::{RttEstimator, constants as timing_constants};
pub use window::{SeqCheck, SeqWindow};
