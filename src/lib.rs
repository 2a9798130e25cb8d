//! Library for the OMI memory-buffer bring-up client.
//! Provides register transactions over the two-wire management bus (direct
//! i2c-dev access or a serial bridge), firmware upload to the memory buffer,
//! link bring-up diagnostics and replayable register sequences.

pub mod bridge;
pub mod command;
pub mod crc;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod i2c;
pub mod image;
pub mod persona;
pub mod register;
pub mod sequence;
pub mod transaction;
pub mod transport;
pub mod upload;

pub use error::{Error, Result};
