//! Declarative register sequences.
//!
//! Bring-up recipes (link training, reset release, ...) are lists of reads
//! and writes kept as JSON next to the tool instead of in code:
//!
//! ```json
//! {
//!   "name": "explorer-sync",
//!   "port_offset": "0x0",
//!   "steps": [
//!     { "op": "read",  "address": "0x08040010" },
//!     { "op": "write", "address": "0x08040017", "value": "0xf800000000000000" },
//!     { "op": "delay", "ms": 10 }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::minimal_be_bytes;
use crate::register::{Readout, RegisterAddress};
use crate::transaction::RegisterBus;
use crate::transport::{Delay, Transport};

/// Parse a hex literal, with or without `0x`, underscores allowed.
pub fn parse_hex(text: &str) -> Result<u128> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .replace('_', "");
    if digits.is_empty() {
        return Err(Error::InvalidHex(text.to_string()));
    }
    u128::from_str_radix(&digits, 16).map_err(|_| Error::InvalidHex(text.to_string()))
}

/// Parse a hex literal that must fit in 64 bits.
pub fn parse_hex_u64(text: &str) -> Result<u64> {
    u64::try_from(parse_hex(text)?).map_err(|_| Error::InvalidHex(text.to_string()))
}

/// 64-bit value written as a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Hex(pub u64);

impl TryFrom<String> for Hex {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        parse_hex_u64(&text).map(Hex)
    }
}

/// Frame content up to 16 bytes, written as a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RawFrame(pub u128);

impl TryFrom<String> for RawFrame {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        parse_hex(&text).map(RawFrame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    /// Read a register; a mismatch against `expected` is reported, not fatal.
    Read {
        address: Hex,
        #[serde(default)]
        expected: Option<Hex>,
        #[serde(default)]
        label: Option<String>,
    },
    /// Verified write.
    Write { address: Hex, value: Hex },
    /// Posted write, no read-back.
    Post { address: Hex, value: Hex },
    /// Frame sent as-is, minimal big-endian length.
    Raw { frame: RawFrame },
    Delay { ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub name: String,
    /// Added to every register address, for cards with several ports.
    #[serde(default = "zero")]
    pub port_offset: Hex,
    pub steps: Vec<Step>,
}

fn zero() -> Hex {
    Hex(0)
}

impl Sequence {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    fn address(&self, address: Hex) -> RegisterAddress {
        RegisterAddress(address.0.wrapping_add(self.port_offset.0))
    }
}

/// Outcome of one read step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub address: RegisterAddress,
    pub label: Option<String>,
    pub readout: Readout,
    pub expected: Option<u64>,
}

impl ReadRecord {
    pub fn matches(&self) -> bool {
        match self.expected {
            Some(expected) => self.readout == Readout::Value(expected),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub steps: usize,
    pub reads: Vec<ReadRecord>,
    pub mismatches: usize,
    pub rejected_writes: usize,
    pub unmapped: usize,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches == 0 && self.rejected_writes == 0 && self.unmapped == 0
    }
}

/// Run every step of `sequence` in order.
///
/// Channel faults abort the replay. Unexpected values, unmapped registers and
/// writes that do not read back are counted in the report instead.
pub fn replay<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
    sequence: &Sequence,
) -> Result<ReplayReport> {
    info!(
        "replaying '{}' ({} steps, port offset {:#x})",
        sequence.name,
        sequence.steps.len(),
        sequence.port_offset.0
    );
    let mut report = ReplayReport::default();

    for step in &sequence.steps {
        debug!("step {}: {step:?}", report.steps);
        match step {
            Step::Read {
                address,
                expected,
                label,
            } => {
                let address = sequence.address(*address);
                let readout = bus.read(address)?;
                let record = ReadRecord {
                    address,
                    label: label.clone(),
                    readout,
                    expected: expected.map(|e| e.0),
                };
                if readout.is_unmapped() {
                    report.unmapped += 1;
                } else if !record.matches() {
                    warn!(
                        "{address}: read {:#x}, expected {:#x}",
                        readout.raw(),
                        record.expected.unwrap_or_default()
                    );
                    report.mismatches += 1;
                }
                report.reads.push(record);
            }
            Step::Write { address, value } => {
                if !bus.write(sequence.address(*address), value.0)? {
                    report.rejected_writes += 1;
                }
            }
            Step::Post { address, value } => {
                bus.post(sequence.address(*address), value.0)?;
            }
            Step::Raw { frame } => {
                bus.send_raw(&minimal_be_bytes(frame.0))?;
            }
            Step::Delay { ms } => bus.pause(Duration::from_millis(*ms)),
        }
        report.steps += 1;
    }

    Ok(report)
}
