//! Register transactions over the byte channel.
//!
//! A [`RegisterBus`] turns narrow (32-bit) and wide (64-bit) registers into
//! single read/write calls. Every call blocks until its frames went out and
//! the replies came back; there is no pipelining and no locking, the bus
//! assumes it is the only user of the channel.

use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{FrameFormat, PayloadSource};
use crate::register::{PhysicalAddress, Readout, RegisterAddress};
use crate::transport::{Delay, StdDelay, Transport, TransportError};

/// Pause before the single retry of a NAK'd or busy transport operation.
pub const RETRY_DELAY: Duration = Duration::from_millis(5);

pub struct RegisterBus<T, D = StdDelay> {
    transport: T,
    delay: D,
    device: u8,
    format: FrameFormat,
}

impl<T: Transport> RegisterBus<T, StdDelay> {
    pub fn new(transport: T, device: u8, format: FrameFormat) -> Self {
        Self::with_delay(transport, device, format, StdDelay)
    }
}

impl<T: Transport, D: Delay> RegisterBus<T, D> {
    pub fn with_delay(transport: T, device: u8, format: FrameFormat, delay: D) -> Self {
        Self {
            transport,
            delay,
            device,
            format,
        }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sleep on the bus' delay provider.
    pub fn pause(&mut self, duration: Duration) {
        self.delay.delay(duration);
    }

    /// Run `op`, retrying exactly once after [`RETRY_DELAY`] if it failed
    /// transiently.
    fn retry_once<R>(
        &mut self,
        mut op: impl FnMut(&mut T, u8) -> std::result::Result<R, TransportError>,
    ) -> Result<R> {
        let device = self.device;
        match op(&mut self.transport, device) {
            Err(e) if e.is_transient() => {
                warn!("transient fault on {device:#04x} ({e}), retrying once");
                self.delay.delay(RETRY_DELAY);
                Ok(op(&mut self.transport, device)?)
            }
            other => Ok(other?),
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        trace!("W {:02X?}", frame);
        self.retry_once(|t, dev| t.write(dev, frame))
    }

    fn receive(&mut self, len: usize) -> Result<Vec<u8>> {
        let bytes = self.retry_once(|t, dev| t.read(dev, len))?;
        trace!("R {:02X?}", bytes);
        Ok(bytes)
    }

    /// Read the status queue once. Formats without a status register have
    /// nothing to drain and return `None`.
    pub fn read_status(&mut self) -> Result<Option<u64>> {
        let (Some(command), Some(op)) = (self.format.status_command(), self.format.opcodes) else {
            return Ok(None);
        };
        self.send(&[command])?;
        let bytes = self.receive(op.status_len)?;
        self.format.decode_payload(&bytes).map(Some)
    }

    /// Flush one entry of the status queue, discarding it.
    fn drain(&mut self) -> Result<()> {
        self.read_status().map(|_| ())
    }

    /// Read one narrow slot of the register file.
    fn read_slot(&mut self, address: PhysicalAddress) -> Result<u64> {
        if self.format.pre_drain {
            self.drain()?;
        }

        let select = self.format.select_frame(address);
        self.send(&select)?;

        let Some(fetch) = self.format.fetch_frame(address) else {
            let payload = self.receive(self.format.payload_len())?;
            return self.format.decode_payload(&payload);
        };

        self.drain()?;
        self.send(&fetch)?;
        let payload = match self.format.status_command() {
            Some(command) if self.format.payload == PayloadSource::StatusRegister => {
                self.send(&[command])?;
                self.receive(self.format.payload_len())?
            }
            _ => self.receive(self.format.payload_len())?,
        };
        let value = self.format.decode_payload(&payload)?;
        self.drain()?;
        Ok(value)
    }

    fn is_wide(&self, address: RegisterAddress) -> bool {
        self.format.wide_registers && address.is_wide()
    }

    fn physical(&self, address: RegisterAddress) -> PhysicalAddress {
        if self.format.wide_registers {
            address.physical()
        } else {
            PhysicalAddress(address.raw())
        }
    }

    /// Read one slot, failing on an out-of-range sentinel.
    fn read_backed_slot(&mut self, address: RegisterAddress, slot: PhysicalAddress) -> Result<u64> {
        let value = self.read_slot(slot)?;
        if self.format.is_out_of_range(value) {
            error!("register {address} is outside the hardware range (sentinel {value:#010x})");
            return Err(Error::OutOfRange {
                address: address.raw(),
                sentinel: value,
            });
        }
        Ok(value)
    }

    /// Read a register. Wide registers are read as two narrow slots, MSB
    /// first, and combined as `(msb << 32) | lsb`.
    pub fn read(&mut self, address: RegisterAddress) -> Result<Readout> {
        let readout = if self.is_wide(address) {
            let (msb_slot, lsb_slot) = address.halves();
            let msb = self.read_backed_slot(address, msb_slot)?;
            let lsb = self.read_backed_slot(address, lsb_slot)?;
            if self.format.is_unmapped(msb) {
                Readout::Unmapped { sentinel: msb }
            } else if self.format.is_unmapped(lsb) {
                Readout::Unmapped { sentinel: lsb }
            } else {
                Readout::Value((msb << 32) | lsb)
            }
        } else {
            let value = self.read_backed_slot(address, self.physical(address))?;
            if self.format.is_unmapped(value) {
                Readout::Unmapped { sentinel: value }
            } else {
                Readout::Value(value)
            }
        };

        match readout {
            Readout::Value(value) => debug!("read {address} = {value:#x}"),
            Readout::Unmapped { sentinel } => {
                warn!("register {address} not mapped yet (sentinel {sentinel:#010x})")
            }
        }
        Ok(readout)
    }

    /// Read a register, treating "not mapped" as an error.
    pub fn read_value(&mut self, address: RegisterAddress) -> Result<u64> {
        self.read(address)?.into_value(address)
    }

    fn write_frames(&mut self, address: RegisterAddress, value: u64, drain: bool) -> Result<()> {
        let slots = if self.is_wide(address) {
            let (msb_slot, lsb_slot) = address.halves();
            vec![(msb_slot, value >> 32), (lsb_slot, value & 0xFFFF_FFFF)]
        } else {
            let mask = match self.format.data_width {
                8 => u64::MAX,
                width => (1u64 << (width * 8)) - 1,
            };
            vec![(self.physical(address), value & mask)]
        };

        for (slot, data) in slots {
            let frame = self.format.write_frame(slot, data);
            self.send(&frame)?;
            if drain {
                self.drain()?;
            }
        }
        Ok(())
    }

    /// Write a register, then read it back.
    ///
    /// Returns `true` only when the immediate read-back equals `value`. The
    /// write is never replayed automatically: registers with side effects
    /// must not see it twice.
    pub fn write(&mut self, address: RegisterAddress, value: u64) -> Result<bool> {
        self.write_frames(address, value, true)?;
        let verified = self.read(address)? == Readout::Value(value);
        if verified {
            debug!("write {address} = {value:#x} verified");
        } else {
            warn!("write {address} = {value:#x} did not read back");
        }
        Ok(verified)
    }

    /// Posted write: frames only, no status drain and no read-back. Used for
    /// staging windows and doorbells where reading back has side effects or
    /// returns something else entirely.
    pub fn post(&mut self, address: RegisterAddress, value: u64) -> Result<()> {
        trace!("post {address} = {value:#x}");
        self.write_frames(address, value, false)
    }

    /// Send a pre-built frame as-is.
    pub fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        self.send(frame)
    }

    /// Read `len` raw bytes from the device.
    pub fn receive_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        self.receive(len)
    }

    /// Check that the device answers on the bus at all.
    pub fn probe(&mut self) -> Result<bool> {
        self.retry_once(|t, dev| t.probe(dev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Channel that replays queued replies and records every write.
    #[derive(Default)]
    struct Scripted {
        writes: Vec<Vec<u8>>,
        replies: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
        write_faults: VecDeque<TransportError>,
    }

    impl Transport for Scripted {
        fn write(&mut self, _device: u8, bytes: &[u8]) -> std::result::Result<(), TransportError> {
            if let Some(fault) = self.write_faults.pop_front() {
                return Err(fault);
            }
            self.writes.push(bytes.to_vec());
            Ok(())
        }

        fn read(&mut self, device: u8, _len: usize) -> std::result::Result<Vec<u8>, TransportError> {
            self.replies
                .pop_front()
                .unwrap_or(Err(TransportError::NotPresent { device }))
        }

        fn probe(&mut self, _device: u8) -> std::result::Result<bool, TransportError> {
            Ok(true)
        }
    }

    struct NoDelay(Vec<Duration>);

    impl Delay for NoDelay {
        fn delay(&mut self, duration: Duration) {
            self.0.push(duration);
        }
    }

    fn status(value: u32) -> std::result::Result<Vec<u8>, TransportError> {
        let mut reply = vec![0x04];
        reply.extend_from_slice(&value.to_be_bytes());
        Ok(reply)
    }

    #[test]
    fn narrow_read_follows_select_drain_fetch_payload_drain() {
        let mut t = Scripted::default();
        t.replies.extend([status(0x0F0003), status(0x796), status(0x0F0004)]);
        let mut bus = RegisterBus::with_delay(t, 0x20, FrameFormat::EXPLORER, NoDelay(vec![]));

        let readout = bus.read(RegisterAddress(0x0020_B080)).ok();
        assert_eq!(readout, Some(Readout::Value(0x796)));

        let t = bus.into_inner();
        assert_eq!(
            t.writes,
            vec![
                vec![0x03, 0x04, 0xA0, 0x20, 0xB0, 0x80],
                vec![0x02],
                vec![0x04, 0x04, 0xA0, 0x20, 0xB0, 0x80],
                vec![0x02],
                vec![0x02],
            ]
        );
    }

    #[test]
    fn transient_fault_is_retried_once() {
        let mut t = Scripted::default();
        t.write_faults.push_back(TransportError::Nak { device: 0x20 });
        let mut bus = RegisterBus::with_delay(t, 0x20, FrameFormat::EXPLORER, NoDelay(vec![]));

        assert!(bus.send_raw(&[0x01]).is_ok());
        assert_eq!(bus.delay.0, vec![RETRY_DELAY]);
        assert_eq!(bus.into_inner().writes, vec![vec![0x01]]);
    }

    #[test]
    fn second_transient_fault_propagates() {
        let mut t = Scripted::default();
        t.write_faults.push_back(TransportError::Busy { device: 0x20 });
        t.write_faults.push_back(TransportError::Nak { device: 0x20 });
        t.write_faults.push_back(TransportError::Nak { device: 0x20 });
        let mut bus = RegisterBus::with_delay(t, 0x20, FrameFormat::EXPLORER, NoDelay(vec![]));

        let err = bus.send_raw(&[0x01]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport(TransportError::Nak { .. })
        ));
        assert_eq!(bus.delay.0.len(), 1);
        // The third fault was never consumed: only one retry happened.
        assert_eq!(bus.into_inner().write_faults.len(), 1);
    }

    #[test]
    fn permanent_fault_is_not_retried() {
        let mut t = Scripted::default();
        t.write_faults.push_back(TransportError::NotPresent { device: 0x20 });
        let mut bus = RegisterBus::with_delay(t, 0x20, FrameFormat::EXPLORER, NoDelay(vec![]));

        assert!(bus.send_raw(&[0x01]).is_err());
        assert!(bus.delay.0.is_empty());
    }
}
