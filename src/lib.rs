//! # udx-mux
//!
//! Reliable, multiplexed streams over a single UDP socket.
//!
//! Many bidirectional streams share one UDP endpoint. Each stream is
//! addressed by a 32-bit routing id and offers:
//!
//! - **Ordered bytes**: writes arrive in order, retransmitted until acked
//! - **Half-close**: each direction ends independently
//! - **Messages**: reliable, unordered datagrams beside the byte stream
//! - **Preconnect**: packets for unknown ids are surfaced so a server can
//!   accept streams on demand
//!
//! ## Feature Flags
//!
//! - `transport` (default): sockets and streams on tokio
//!
//! ## Modules
//!
//! - [`core`]: Wire codec, constants and decode errors (always included)
//! - [`transport`]: Sockets and streams (requires `transport` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use udx_mux::prelude::*;
//!
//! # async fn run() -> TransportResult<()> {
//! let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await?;
//! let addr = socket.local_addr();
//!
//! let mut a = Stream::new(1);
//! let mut b = Stream::new(2);
//! a.connect(&socket, 2, addr)?;
//! b.connect(&socket, 1, addr)?;
//!
//! a.end_with("hello")?;
//! while let Some(event) = b.recv().await {
//!     match event {
//!         StreamEvent::Data(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
//!         StreamEvent::End => b.end()?,
//!         _ => {}
//!     }
//! }
//! # let _ = a.recv().await;
//! socket.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{DecodeError, Packet, PacketKind};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Preconnect, Socket, SocketBuilder, SocketConfig, SocketStats, Stream, StreamError,
        StreamEvent, TransportError, TransportResult, WriteAck,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{DecodeError, Packet, PacketKind};

#[cfg(feature = "transport")]
pub use transport::{
    Socket, SocketBuilder, SocketConfig, Stream, StreamError, StreamEvent, TransportError,
    TransportResult, WriteAck,
};
