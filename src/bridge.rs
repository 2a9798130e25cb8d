//! Serial-attached I2C bridge.
//!
//! The host talks to the bridge adapter over a serial port with small
//! checksummed packets; the adapter performs the actual bus transaction and
//! answers with a status packet.
//!
//! Request:  `FF FF <device> <len> <instruction> <params..> <checksum>`
//! Response: `FF FF <device> <len> <status> <params..> <checksum>`
//!
//! `len` counts the instruction/status byte, the params and the checksum.
//! The checksum is the inverted low byte of the sum of every byte after the
//! two-byte header.

use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::trace;

use crate::transport::{Transport, TransportError};

pub const DEFAULT_TIMEOUT_MS: u64 = 500;
pub const PROBE_TIMEOUT_MS: u64 = 30;

pub const INSTR_PROBE: u8 = 0x01;
pub const INSTR_WRITE: u8 = 0x02;
pub const INSTR_READ: u8 = 0x03;

/// Status byte flags in a response packet.
pub const STATUS_NAK: u8 = 0x01;
pub const STATUS_BUSY: u8 = 0x02;
pub const STATUS_NO_DEVICE: u8 = 0x04;

/// Largest payload a single packet can carry (`len` is one byte).
pub const MAX_PARAMS: usize = 0xFF - 2;

/// Build a bridge request packet.
pub fn build_packet(device: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() as u8).saturating_add(2); // instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.push(0xFF);
    packet.push(0xFF);
    packet.push(device);
    packet.push(length);
    packet.push(instruction);
    packet.extend_from_slice(params);

    packet.push(checksum(&packet[2..]));
    packet
}

fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| b as u32).sum();
    (!sum & 0xFF) as u8
}

/// A decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device: u8,
    pub status: u8,
    pub params: Vec<u8>,
}

/// Parse a full response packet.
pub fn parse_response(raw: &[u8]) -> Result<Response, TransportError> {
    if raw.len() < 6 || raw[0] != 0xFF || raw[1] != 0xFF {
        return Err(TransportError::protocol(format!(
            "malformed response {raw:02X?}"
        )));
    }
    let length = raw[3] as usize;
    if raw.len() != 4 + length || length < 2 {
        return Err(TransportError::protocol(format!(
            "response length {length} does not match {} received bytes",
            raw.len()
        )));
    }
    let (body, crc) = raw[2..].split_at(raw.len() - 3);
    if checksum(body) != crc[0] {
        return Err(TransportError::protocol(format!(
            "response checksum mismatch in {raw:02X?}"
        )));
    }
    Ok(Response {
        device: raw[2],
        status: raw[4],
        params: raw[5..raw.len() - 1].to_vec(),
    })
}

/// [`Transport`] over a serial-attached bridge adapter.
pub struct SerialBridge {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

impl SerialBridge {
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let port = serialport::new(path, baud).timeout(timeout).open()?;
        Ok(Self { port, timeout })
    }

    pub fn from_port(port: Box<dyn serialport::SerialPort>) -> Self {
        Self {
            port,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    fn exchange(
        &mut self,
        device: u8,
        instruction: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if params.len() > MAX_PARAMS {
            return Err(TransportError::protocol(format!(
                "{} bytes do not fit in one bridge packet",
                params.len()
            )));
        }
        let packet = build_packet(device, instruction, params);
        trace!("bridge -> {:02X?}", packet);
        self.port.write_all(&packet)?;
        self.port.flush()?;

        let mut header = [0u8; 4];
        read_exact(&mut *self.port, &mut header)?;
        let mut rest = vec![0u8; header[3] as usize];
        read_exact(&mut *self.port, &mut rest)?;

        let mut raw = header.to_vec();
        raw.extend_from_slice(&rest);
        trace!("bridge <- {:02X?}", raw);

        let response = parse_response(&raw)?;
        if response.device != device {
            return Err(TransportError::protocol(format!(
                "response from {:#04x} while addressing {device:#04x}",
                response.device
            )));
        }
        match response.status {
            0 => Ok(response.params),
            s if s & STATUS_NO_DEVICE != 0 => Err(TransportError::NotPresent { device }),
            s if s & STATUS_BUSY != 0 => Err(TransportError::Busy { device }),
            s if s & STATUS_NAK != 0 => Err(TransportError::Nak { device }),
            other => Err(TransportError::protocol(format!(
                "unknown bridge status {other:#04x}"
            ))),
        }
    }
}

fn read_exact(port: &mut dyn serialport::SerialPort, buf: &mut [u8]) -> Result<(), TransportError> {
    match port.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(TransportError::protocol(
            "bridge did not answer in time",
        )),
        Err(e) => Err(e.into()),
    }
}

impl Transport for SerialBridge {
    fn write(&mut self, device: u8, bytes: &[u8]) -> Result<(), TransportError> {
        self.exchange(device, INSTR_WRITE, bytes).map(|_| ())
    }

    fn read(&mut self, device: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        if len > MAX_PARAMS {
            return Err(TransportError::protocol(format!(
                "cannot read {len} bytes in one bridge packet"
            )));
        }
        let data = self.exchange(device, INSTR_READ, &[len as u8])?;
        if data.len() != len {
            return Err(TransportError::protocol(format!(
                "asked for {len} bytes, bridge returned {}",
                data.len()
            )));
        }
        Ok(data)
    }

    fn probe(&mut self, device: u8) -> Result<bool, TransportError> {
        // Use a short timeout to keep scanning quick.
        self.port.set_timeout(Duration::from_millis(PROBE_TIMEOUT_MS))?;
        let result = self.exchange(device, INSTR_PROBE, &[]);
        self.port.set_timeout(self.timeout)?;

        match result {
            Ok(_) => Ok(true),
            Err(TransportError::NotPresent { .. } | TransportError::Nak { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_checksum_matches_examples() {
        // FF FF 20 02 01 DC: probe of the memory buffer
        let pkt = build_packet(0x20, INSTR_PROBE, &[]);
        assert_eq!(pkt, vec![0xFF, 0xFF, 0x20, 0x02, 0x01, 0xDC]);

        // FF FF 38 03 03 08 B9: 8-byte read from the FPGA
        let pkt = build_packet(0x38, INSTR_READ, &[0x08]);
        assert_eq!(pkt, vec![0xFF, 0xFF, 0x38, 0x03, 0x03, 0x08, 0xB9]);
    }

    #[test]
    fn response_round_trips_through_parser() {
        // A response is laid out like a request with the status in place of
        // the instruction.
        let raw = build_packet(0x20, 0x00, &[0x04, 0x00, 0x00, 0x00, 0x01]);
        let resp = parse_response(&raw).ok();
        assert_eq!(
            resp,
            Some(Response {
                device: 0x20,
                status: 0,
                params: vec![0x04, 0x00, 0x00, 0x00, 0x01],
            })
        );
    }

    #[test]
    fn corrupted_response_is_rejected() {
        let mut raw = build_packet(0x20, 0x00, &[0x01, 0x02]);
        raw[5] ^= 0x40;
        assert!(matches!(
            parse_response(&raw),
            Err(TransportError::Protocol { .. })
        ));
        assert!(parse_response(&[0xFF, 0xFF, 0x20]).is_err());
    }
}
