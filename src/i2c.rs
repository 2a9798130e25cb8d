//! Direct two-wire access through any `embedded-hal` I2C controller.
//!
//! On Linux this is the kernel's i2c-dev interface (`/dev/i2c-N`), the way
//! the card's management bus is normally reached from the host.

use embedded_hal::i2c::{Error as _, ErrorKind, I2c, NoAcknowledgeSource};
use tracing::trace;

use crate::transport::{Transport, TransportError};

/// Bus the card's management controller is wired to on the reference host.
pub const DEFAULT_BUS: u32 = 3;

/// [`Transport`] over an `embedded-hal` I2C controller.
pub struct HalI2c<I> {
    i2c: I,
}

impl<I: I2c> HalI2c<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn into_inner(self) -> I {
        self.i2c
    }
}

fn fault<E: embedded_hal::i2c::Error>(device: u8, e: E) -> TransportError {
    match e.kind() {
        ErrorKind::NoAcknowledge(_) => TransportError::Nak { device },
        ErrorKind::ArbitrationLoss | ErrorKind::Bus => TransportError::Busy { device },
        other => TransportError::protocol(format!("i2c error on {device:#04x}: {other:?}")),
    }
}

impl<I: I2c> Transport for HalI2c<I> {
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("i2c {device:#04x} <- {:02X?}", bytes);
        self.i2c.write(device, bytes).map_err(|e| fault(device, e))
    }

    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        self.i2c.read(device, &mut buf).map_err(|e| fault(device, e))?;
        trace!("i2c {device:#04x} -> {:02X?}", buf);
        Ok(buf)
    }

    /// Zero-length write: only the address byte goes out.
    fn probe(&mut self, device: u8) -> Result<bool, TransportError> {
        match self.i2c.write(device, &[]) {
            Ok(()) => Ok(true),
            Err(e) => match e.kind() {
                ErrorKind::NoAcknowledge(
                    NoAcknowledgeSource::Address | NoAcknowledgeSource::Unknown,
                ) => Ok(false),
                _ => Err(fault(device, e)),
            },
        }
    }
}

/// Open `/dev/i2c-<bus>`.
#[cfg(target_os = "linux")]
pub fn open_linux(bus: u32) -> Result<HalI2c<linux_embedded_hal::I2cdev>, TransportError> {
    let path = format!("/dev/i2c-{bus}");
    let dev = linux_embedded_hal::I2cdev::new(&path).map_err(|e| TransportError::Open {
        path,
        reason: e.to_string(),
    })?;
    Ok(HalI2c::new(dev))
}
