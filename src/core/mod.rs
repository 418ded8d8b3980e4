//! Core types: wire codec, constants and decode errors.
//!
//! Nothing in this module performs I/O, so it is available without the
//! `transport` feature.

mod constants;
mod error;
mod frame;

pub use constants::*;
pub use error::*;
pub use frame::*;
