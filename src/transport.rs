//! The byte channel the register layer is built on.

use std::time::Duration;

use thiserror::Error;

/// Faults reported by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The addressed device did not acknowledge.
    #[error("device {device:#04x} NAK")]
    Nak { device: u8 },

    /// The bus was held by someone else or the adapter was busy.
    #[error("bus busy while addressing {device:#04x}")]
    Busy { device: u8 },

    /// Nothing answers at this address.
    #[error("no device at {device:#04x}")]
    NotPresent { device: u8 },

    /// The adapter answered with something we cannot interpret.
    #[error("adapter protocol error: {reason}")]
    Protocol { reason: String },

    /// The bus device could not be opened.
    #[error("cannot open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// NAK and busy are expected to clear up by themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Nak { .. } | Self::Busy { .. })
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

/// Half-duplex byte channel addressed by a 7-bit device identifier.
///
/// Implementations move bytes only; they have no notion of registers.
pub trait Transport {
    /// Write `bytes` to `device` in one bus transaction.
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes from `device`.
    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Check whether `device` acknowledges its address.
    fn probe(&mut self, device: u8) -> Result<bool, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(device, bytes)
    }

    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(device, len)
    }

    fn probe(&mut self, device: u8) -> Result<bool, TransportError> {
        (**self).probe(device)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(device, bytes)
    }

    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(device, len)
    }

    fn probe(&mut self, device: u8) -> Result<bool, TransportError> {
        (**self).probe(device)
    }
}

/// Blocking, non-cancellable sleep used for retry backoff and polling.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// [`Delay`] backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
