use crate::error::{Error, Result};
use crate::register::PhysicalAddress;

/// Opcodes of the memory-buffer command protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcodes {
    /// Latch a register address for the next fetch.
    pub select: u8,
    /// Fetch the latched register into the response queue.
    pub fetch: u8,
    /// Write address + data.
    pub write: u8,
    /// Command byte that reads the status/response queue.
    pub status_register: u8,
    /// Bytes returned by a status read: one length marker, then the word.
    pub status_len: usize,
}

/// Where the payload of a read comes from once the fetch frame is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// Read it from the status register like any other response.
    StatusRegister,
    /// The device answers the fetch frame itself with a status-shaped reply.
    Direct,
}

/// How a persona lays out its frames on the wire.
///
/// All fields are big-endian. Formats with `opcodes` prefix every frame with
/// an opcode byte and a payload length byte; formats without them send the
/// bare address (and data, for writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub name: &'static str,
    /// Width of the address field in bytes.
    pub address_width: usize,
    /// Width of a single data transfer in bytes.
    pub data_width: usize,
    /// Added to every physical address before it goes on the wire.
    pub window: u64,
    pub opcodes: Option<Opcodes>,
    /// Whether the wide-register flag is meaningful for this persona.
    pub wide_registers: bool,
    pub payload: PayloadSource,
    /// Drain the status queue once more before each select.
    pub pre_drain: bool,
    /// Values the hardware returns for addresses it has not mapped yet.
    pub unmapped: &'static [u64],
    /// Values returned for addresses no hardware backs at all.
    pub out_of_range: &'static [u64],
}

const EXPLORER_OPCODES: Opcodes = Opcodes {
    select: 0x03,
    fetch: 0x04,
    write: 0x05,
    status_register: 0x02,
    status_len: 5,
};

impl FrameFormat {
    /// Traffic-generator FPGA: 8-byte address, 8-byte data, no opcodes.
    pub const FPGA: FrameFormat = FrameFormat {
        name: "fpga",
        address_width: 8,
        data_width: 8,
        window: 0,
        opcodes: None,
        wide_registers: false,
        payload: PayloadSource::Direct,
        pre_drain: false,
        unmapped: &[0xDEC0_DE1C],
        out_of_range: &[],
    };

    /// Memory-buffer firmware persona.
    pub const EXPLORER: FrameFormat = FrameFormat {
        name: "explorer",
        address_width: 4,
        data_width: 4,
        window: 0xA000_0000,
        opcodes: Some(EXPLORER_OPCODES),
        wide_registers: true,
        payload: PayloadSource::StatusRegister,
        pre_drain: false,
        unmapped: &[0xDEC0_DE1C],
        out_of_range: &[],
    };

    /// Alternate silicon sharing the memory-buffer bus address.
    pub const ICE: FrameFormat = FrameFormat {
        name: "ice",
        address_width: 4,
        data_width: 4,
        window: 0xA000_0000,
        opcodes: Some(EXPLORER_OPCODES),
        wide_registers: true,
        payload: PayloadSource::Direct,
        pre_drain: true,
        unmapped: &[0xDEC0_DE00],
        out_of_range: &[0xDEC0_DE0B],
    };

    pub fn is_unmapped(&self, value: u64) -> bool {
        self.unmapped.contains(&value)
    }

    pub fn is_out_of_range(&self, value: u64) -> bool {
        self.out_of_range.contains(&value)
    }

    /// Bytes to read for the payload of a fetch.
    pub fn payload_len(&self) -> usize {
        match self.opcodes {
            Some(op) => op.status_len,
            None => self.data_width,
        }
    }

    fn wire_address(&self, address: PhysicalAddress) -> u64 {
        address.raw().wrapping_add(self.window)
    }

    /// Frame selecting `address` for a later fetch (or, without opcodes, the
    /// bare address whose content the device queues immediately).
    pub fn select_frame(&self, address: PhysicalAddress) -> Vec<u8> {
        let select = self.opcodes.map(|op| op.select);
        self.address_frame(select, address)
    }

    /// Frame fetching a previously selected register. Formats without
    /// opcodes have no fetch step.
    pub fn fetch_frame(&self, address: PhysicalAddress) -> Option<Vec<u8>> {
        self.opcodes
            .map(|op| self.address_frame(Some(op.fetch), address))
    }

    fn address_frame(&self, opcode: Option<u8>, address: PhysicalAddress) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.address_width);
        if let Some(opcode) = opcode {
            frame.push(opcode);
            frame.push(self.address_width as u8);
        }
        push_be(&mut frame, self.wire_address(address), self.address_width);
        frame
    }

    /// Frame writing `data` (truncated to `data_width`) at `address`.
    pub fn write_frame(&self, address: PhysicalAddress, data: u64) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.address_width + self.data_width);
        if let Some(op) = self.opcodes {
            frame.push(op.write);
            frame.push((self.address_width + self.data_width) as u8);
        }
        push_be(&mut frame, self.wire_address(address), self.address_width);
        push_be(&mut frame, data, self.data_width);
        frame
    }

    /// Command byte that precedes a status read, if the format has one.
    pub fn status_command(&self) -> Option<u8> {
        self.opcodes.map(|op| op.status_register)
    }

    /// Decode the payload bytes returned for a fetch.
    ///
    /// Status-shaped replies carry a length marker in their first byte that
    /// is not part of the value.
    pub fn decode_payload(&self, bytes: &[u8]) -> Result<u64> {
        let body = match self.opcodes {
            Some(_) => bytes.get(1..).unwrap_or(&[]),
            None => bytes,
        };
        if body.len() != self.data_width {
            return Err(Error::frame(format!(
                "{} payload: expected {} data bytes, got {} ({:02X?})",
                self.name,
                self.data_width,
                body.len(),
                bytes
            )));
        }
        Ok(from_be(body))
    }
}

fn push_be(frame: &mut Vec<u8>, value: u64, width: usize) {
    let bytes = value.to_be_bytes();
    frame.extend_from_slice(&bytes[bytes.len() - width..]);
}

fn from_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Big-endian bytes of `value` with leading zero bytes dropped. Zero encodes
/// as a single zero byte.
pub fn minimal_be_bytes(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explorer_select_and_fetch_frames() {
        let f = FrameFormat::EXPLORER;
        let addr = PhysicalAddress(0x0809_4098);
        assert_eq!(f.select_frame(addr), vec![0x03, 0x04, 0xA8, 0x09, 0x40, 0x98]);
        assert_eq!(
            f.fetch_frame(addr),
            Some(vec![0x04, 0x04, 0xA8, 0x09, 0x40, 0x98])
        );
    }

    #[test]
    fn explorer_write_frame_matches_captured_trace() {
        // 0508A809408800000400: MSB half of 0x0000040000000059 at 0x08012811
        let f = FrameFormat::EXPLORER;
        let frame = f.write_frame(PhysicalAddress(0x0809_4088), 0x0000_0400);
        assert_eq!(
            frame,
            vec![0x05, 0x08, 0xA8, 0x09, 0x40, 0x88, 0x00, 0x00, 0x04, 0x00]
        );
    }

    #[test]
    fn fpga_frames_are_bare_address_and_data() {
        let f = FrameFormat::FPGA;
        let addr = PhysicalAddress(0x0102_0000_0000_0020);
        assert_eq!(f.select_frame(addr), addr.raw().to_be_bytes().to_vec());
        assert_eq!(f.fetch_frame(addr), None);

        let frame = f.write_frame(addr, 0x1122_3344_5566_7788);
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[8..], &0x1122_3344_5566_7788u64.to_be_bytes());
    }

    #[test]
    fn status_payload_skips_length_marker() {
        let f = FrameFormat::EXPLORER;
        let value = f.decode_payload(&[0x04, 0x00, 0x00, 0x07, 0x96]).ok();
        assert_eq!(value, Some(0x796));
        assert!(f.decode_payload(&[0x04, 0x00]).is_err());
    }

    #[test]
    fn minimal_encoding_drops_leading_zeros() {
        assert_eq!(
            minimal_be_bytes(0x0304_A000_2058),
            vec![0x03, 0x04, 0xA0, 0x00, 0x20, 0x58]
        );
        assert_eq!(minimal_be_bytes(0), vec![0x00]);
        assert_eq!(minimal_be_bytes(0x0508_A808_4738_8000_0000).len(), 10);
    }

    #[test]
    fn minimal_encoding_equals_fixed_encoding_for_opcode_frames() {
        let f = FrameFormat::EXPLORER;
        let frame = f.write_frame(PhysicalAddress(0x0808_4738), 0x8000_0000);
        let as_int = frame.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128);
        assert_eq!(minimal_be_bytes(as_int), frame);
    }
}
