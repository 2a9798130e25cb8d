//! Device personas reachable on the two-wire channel, bus discovery and
//! FPGA identification.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::frame::FrameFormat;
use crate::register::{Readout, explorer, fpga};
use crate::transaction::RegisterBus;
use crate::transport::{Delay, Transport, TransportError};

pub const FPGA_ADDR: u8 = 0x38;
pub const MEMORY_BUFFER_ADDR: u8 = 0x20;
pub const MUX1_ADDR: u8 = 0x70;
pub const MUX2_ADDR: u8 = 0x73;
pub const MUX3_ADDR: u8 = 0x71;
pub const EEPROM_ADDR: u8 = 0x50;
pub const POWER_CTRL_ADDR: u8 = 0x64;
pub const PMIC1_ADDR: u8 = 0x4F;
pub const PMIC2_ADDR: u8 = 0x67;

/// Highest 7-bit address probed by a scan (exclusive).
pub const SCAN_END: u8 = 0x7F;

/// A device personality with its own frame format and register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Persona {
    /// Traffic-generator FPGA.
    Fpga,
    /// Firmware-bearing memory buffer.
    Explorer,
    /// Alternate silicon sharing the memory buffer's bus address.
    Ice,
}

impl Persona {
    pub fn format(self) -> FrameFormat {
        match self {
            Persona::Fpga => FrameFormat::FPGA,
            Persona::Explorer => FrameFormat::EXPLORER,
            Persona::Ice => FrameFormat::ICE,
        }
    }

    /// Default bus address of the persona.
    pub fn device(self) -> u8 {
        match self {
            Persona::Fpga => FPGA_ADDR,
            Persona::Explorer | Persona::Ice => MEMORY_BUFFER_ADDR,
        }
    }

    /// Register bus for this persona on `transport`.
    pub fn bus<T: Transport>(self, transport: T) -> RegisterBus<T> {
        RegisterBus::new(transport, self.device(), self.format())
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.format().name)
    }
}

/// Components known to live on the card's management bus.
pub const KNOWN_DEVICES: &[(u8, &str)] = &[
    (MEMORY_BUFFER_ADDR, "memory buffer"),
    (FPGA_ADDR, "FPGA"),
    (MUX1_ADDR, "MUX1"),
    (MUX2_ADDR, "MUX2"),
    (MUX3_ADDR, "MUX3"),
    (EEPROM_ADDR, "EEPROM"),
    (POWER_CTRL_ADDR, "power controller"),
    (PMIC1_ADDR, "PMIC1"),
    (PMIC2_ADDR, "PMIC2"),
];

pub fn device_name(address: u8) -> Option<&'static str> {
    KNOWN_DEVICES
        .iter()
        .find(|(a, _)| *a == address)
        .map(|(_, name)| *name)
}

/// Card family inferred from which power-management parts answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Ddimm,
    Gemini,
    Unknown,
}

impl fmt::Display for CardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CardKind::Ddimm => "DDIMM",
            CardKind::Gemini => "Gemini",
            CardKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of a one-shot bus scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Addresses that acknowledged, in ascending order.
    pub alive: Vec<u8>,
}

impl ScanReport {
    pub fn card(&self) -> CardKind {
        if self.alive.contains(&PMIC2_ADDR) {
            CardKind::Ddimm
        } else if self.alive.contains(&POWER_CTRL_ADDR) {
            CardKind::Gemini
        } else {
            CardKind::Unknown
        }
    }

    /// Alive addresses paired with their component name, if known.
    pub fn components(&self) -> impl Iterator<Item = (u8, Option<&'static str>)> + '_ {
        self.alive.iter().map(|&a| (a, device_name(a)))
    }
}

/// Probe every address from 0x01 up to [`SCAN_END`] once.
///
/// Addresses that do not answer are skipped; only faults of the channel
/// itself (adapter gone, garbled reply) abort the scan.
pub fn scan<T: Transport>(transport: &mut T) -> Result<ScanReport> {
    let mut alive = Vec::new();
    for address in 1..SCAN_END {
        match transport.probe(address) {
            Ok(true) => {
                debug!("{address:#04x} answered");
                alive.push(address);
            }
            Ok(false) => {}
            Err(TransportError::Busy { .. } | TransportError::Nak { .. }) => {
                warn!("{address:#04x} busy during scan, skipped");
            }
            Err(e) => return Err(e.into()),
        }
    }
    let report = ScanReport { alive };
    info!("scan found {} devices, card looks like {}", report.alive.len(), report.card());
    Ok(report)
}

const FPGA_REVISION_MASK: u64 = 0x0FFF_FFFF;
const FPGA_DIRTY_BIT: u64 = 1 << 28;
const FPGA_CLOCK_SHIFT: u32 = 29;

/// Clock code meaning 400 MHz.
///
/// The code is documented for the upper word of the ICE identification
/// register (see [`crate::diagnostics::IceId`]). Reading it from bits 29..31
/// of the FPGA version register assumes the FPGA shares that layout; the
/// only FPGA-side evidence are the revision lists below, so a zero code
/// falls back to them.
const CLOCK_CODE_400: u8 = 3;

/// Bitstream revisions with a known link clock.
const LEGACY_400_MHZ: &[u32] = &[0x0B20_B168, 0x090A_D53D, 0x0A03_2D32, 0x093A_2CD0];
const LEGACY_333_MHZ: &[u32] = &[0x05CD_07BE, 0x0E52_5BAD];

/// Decoded FPGA version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpgaId {
    pub raw: u64,
    /// Git revision of the bitstream (28 bits).
    pub revision: u32,
    /// Built from a dirty tree.
    pub dirty: bool,
    /// Clock code from bits 29..31, zero on legacy bitstreams.
    pub clock_code: u8,
}

impl FpgaId {
    pub fn decode(raw: u64) -> Self {
        Self {
            raw,
            revision: (raw & FPGA_REVISION_MASK) as u32,
            dirty: raw & FPGA_DIRTY_BIT != 0,
            clock_code: ((raw >> FPGA_CLOCK_SHIFT) & 0x7) as u8,
        }
    }

    /// Link clock in MHz, if the register tells.
    ///
    /// A non-zero clock code wins (its layout is inferred from the ICE id);
    /// otherwise the revision is looked up in the known-revision tables.
    pub fn clock_mhz(&self) -> Option<u32> {
        match self.clock_code {
            CLOCK_CODE_400 => Some(400),
            0 => {
                if LEGACY_400_MHZ.contains(&self.revision) {
                    Some(400)
                } else if LEGACY_333_MHZ.contains(&self.revision) {
                    Some(333)
                } else {
                    None
                }
            }
            _ => Some(333),
        }
    }

    /// [`FpgaId::clock_mhz`], or `fallback` for unknown bitstreams.
    pub fn clock_or(&self, fallback: u32) -> u32 {
        self.clock_mhz().unwrap_or(fallback)
    }
}

impl fmt::Display for FpgaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#09x}", self.revision)?;
        if self.dirty {
            f.write_str(" (dirty)")?;
        }
        Ok(())
    }
}

/// Read and decode the FPGA version register.
pub fn identify<T: Transport, D: Delay>(bus: &mut RegisterBus<T, D>) -> Result<FpgaId> {
    let raw = bus.read_value(fpga::VERSION)?;
    let id = FpgaId::decode(raw);
    info!("FPGA revision {id}, clock code {}", id.clock_code);
    Ok(id)
}

/// One labelled entry of the firmware metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEntry {
    pub label: &'static str,
    pub readout: Readout,
}

/// Ask the memory-buffer firmware for its metadata block and read it.
///
/// The request reuses the command window and doorbells of the upload, so it
/// must not run while an upload is in flight.
pub fn firmware_info<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
) -> Result<Vec<InfoEntry>> {
    bus.post(explorer::INBOUND_DOORBELL_CLEAR, explorer::DOORBELL_BIT)?;
    bus.post(explorer::OUTBOUND_DOORBELL, 1)?;
    for (i, &word) in explorer::INFO_REQUEST.iter().enumerate() {
        bus.post(explorer::COMMAND_WINDOW.offset(4 * i as u64), word as u64)?;
    }
    bus.post(explorer::INBOUND_DOORBELL_SET, explorer::DOORBELL_BIT)?;

    let ready = bus.read(explorer::OUTBOUND_DOORBELL)?;
    if ready.value() != Some(explorer::RESPONSE_READY) {
        warn!("firmware did not flag the info response ({:#x})", ready.raw());
    }

    let mut entries = Vec::with_capacity(explorer::FIRMWARE_INFO.len());
    for &(address, label) in explorer::FIRMWARE_INFO {
        let readout = bus.read(address)?;
        entries.push(InfoEntry { label, readout });
    }

    bus.post(explorer::INBOUND_DOORBELL_CLEAR, explorer::DOORBELL_BIT)?;
    bus.post(explorer::OUTBOUND_DOORBELL, 1)?;
    Ok(entries)
}
