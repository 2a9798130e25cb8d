//! Link bring-up and chip identification on the memory buffer.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::minimal_be_bytes;
use crate::register::{RegisterAddress, explorer};
use crate::transaction::RegisterBus;
use crate::transport::{Delay, Transport};

/// OMI setup command; the low byte carries the link speed code.
pub const SETUP_COMMAND: u64 = 0x0104_0000_8090;

/// Status reads tolerated while the setup command is still running.
pub const INIT_POLL_LIMIT: u32 = 200;
pub const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Speed code the memory buffer expects for a link clock.
pub fn link_speed_code(mhz: u32) -> Result<u8> {
    match mhz {
        333 => Ok(0x1),
        400 => Ok(0x3),
        _ => Err(Error::UnsupportedClock { mhz }),
    }
}

fn busy(status: u64) -> bool {
    (status >> 8) & 0xFF != 0
}

/// Run the OMI setup on the memory buffer for a link clocked at `mhz`.
///
/// Sends the setup command, then reads the status queue until its busy
/// byte clears, plus one more read to flush the final status. Returns the
/// speed code that was sent.
pub fn init_link<T: Transport, D: Delay>(bus: &mut RegisterBus<T, D>, mhz: u32) -> Result<u8> {
    let code = link_speed_code(mhz)?;
    if bus.format().status_command().is_none() {
        return Err(Error::NoStatusRegister {
            persona: bus.format().name,
        });
    }

    let frame = minimal_be_bytes((SETUP_COMMAND + code as u64) as u128);
    info!("OMI setup for {mhz} MHz ({:02X?})", frame);
    bus.send_raw(&frame)?;

    let mut attempts = 0;
    loop {
        let status = bus
            .read_status()?
            .ok_or(Error::NoStatusRegister {
                persona: bus.format().name,
            })?;
        attempts += 1;
        if !busy(status) {
            break;
        }
        if attempts > INIT_POLL_LIMIT {
            return Err(Error::InitTimeout {
                attempts,
                last: status,
            });
        }
        debug!("setup busy ({status:#010x}), poll {attempts}");
        bus.pause(INIT_POLL_INTERVAL);
    }
    bus.read_status()?;
    Ok(code)
}

/// Electronic chip id, most significant word first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecid(pub Vec<u32>);

impl fmt::Display for Ecid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for word in &self.0 {
            write!(f, "{word:08x}")?;
        }
        Ok(())
    }
}

/// Identity of the memory buffer and its card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerInfo {
    pub ecid: Ecid,
    pub enterprise_mode: u64,
    pub card_id: u64,
}

/// Read the chip id, enterprise-mode status and card id.
///
/// These registers only answer once the link setup ran; before that they
/// come back unmapped and this fails with [`Error::NotMapped`].
pub fn explorer_info<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
) -> Result<ExplorerInfo> {
    let enterprise_mode = bus.read_value(explorer::ENTERPRISE_MODE)?;

    let low = explorer::ECID_LOW.raw();
    let high = explorer::ECID_HIGH.raw();
    let mut words = Vec::with_capacity(((high - low) / 4 + 1) as usize);
    for address in (low..=high).rev().step_by(4) {
        words.push(bus.read_value(RegisterAddress(address))? as u32);
    }

    let card_id = bus.read_value(explorer::CARD_ID)?;
    Ok(ExplorerInfo {
        ecid: Ecid(words),
        enterprise_mode,
        card_id,
    })
}

/// Meaning of each bit of the training status register.
pub const LINK_ERRORS: &[&str; 48] = &[
    "UE on control flit frame buffer",
    "UE on control flit replay buffer",
    "Ack pointer overflow",
    "Illegal run length from TL",
    "Truncated flit from TL",
    "Data parity error",
    "Control parity error",
    "RX receiving illegal run length",
    "RX receiving slow",
    "Illegal Tx lane reversal request",
    "Flit hammer: possible data corruption, link brought down",
    "Spare",
    "ECC UE on data flit frame buffer",
    "ECC UE on data flit replay buffer",
    "ECC CE error frame buffer",
    "ECC CE error replay buffer",
    "CRC error detected",
    "NACK received",
    "TX side in x4 mode",
    "RX side in x4 mode",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "EDPL parity error on lane",
    "Spare",
    "Tx flit macro requested a retrain (see CYA register)",
    "No forward progress timeout",
    "Remote side started retraining",
    "Software retrain",
    "Lost block lock",
    "Deskew overflow",
    "Received illegal sync header",
    "EDPL threshold reached",
    "RX performance threshold breached",
    "TX performance threshold breached",
    "Training done",
    "Remote link error bit",
    "Remote link error bit",
    "Remote link error bit",
    "Remote link error bit",
    "Remote link error bit",
    "Remote link error bit",
    "Remote link error bit",
    "Reset on write to bit 0 (or on read, if config1 bit 44 is set)",
];

/// Training status register of the memory buffer's data link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingStatus(pub u64);

impl TrainingStatus {
    pub fn done(self) -> bool {
        self.0 & explorer::TRAINING_DONE != 0
    }

    /// Error bits that are set, with their meaning.
    pub fn errors(self) -> impl Iterator<Item = (u32, &'static str)> {
        LINK_ERRORS
            .iter()
            .enumerate()
            .map(|(bit, label)| (bit as u32, *label))
            .filter(move |&(bit, _)| {
                1u64 << bit != explorer::TRAINING_DONE && self.0 & (1 << bit) != 0
            })
    }
}

/// Read the link training status. Meant to run after both ends trained.
pub fn training_status<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
) -> Result<TrainingStatus> {
    let status = TrainingStatus(bus.read_value(explorer::TRAINING_STATUS)?);
    if status.done() {
        info!("link training done ({:#018x})", status.0);
    } else {
        warn!(
            "link not trained ({:#018x}), {} error bits set",
            status.0,
            status.errors().count()
        );
    }
    Ok(status)
}

/// Decoded identification register of the ICE chip.
///
/// The upper word carries the bitstream revision, dirty flag and clock code
/// in the same layout as the FPGA version register; the lower word carries
/// release and chip id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceId {
    pub raw: u64,
    pub revision: u32,
    pub dirty: bool,
    pub clock_code: u8,
    pub major: u8,
    pub minor: u8,
    pub chip_id: u8,
}

impl IceId {
    pub fn decode(raw: u64) -> Self {
        let upper = raw >> 32;
        Self {
            raw,
            revision: (upper & 0x0FFF_FFFF) as u32,
            dirty: upper & (1 << 28) != 0,
            clock_code: ((upper >> 29) & 0x7) as u8,
            major: ((raw >> 28) & 0xF) as u8,
            minor: ((raw >> 24) & 0xF) as u8,
            chip_id: (raw & 0xFF) as u8,
        }
    }

    /// Code 3 is 400 MHz; every other code is 333 MHz.
    pub fn clock_mhz(&self) -> u32 {
        if self.clock_code == 3 { 400 } else { 333 }
    }
}

/// Read and decode the ICE identification register at `address`.
pub fn ice_identify<T: Transport, D: Delay>(
    bus: &mut RegisterBus<T, D>,
    address: RegisterAddress,
) -> Result<IceId> {
    if !address.is_wide() {
        warn!("{address} is a 32-bit register; the revision half will read as zero");
    }
    let id = IceId::decode(bus.read_value(address)?);
    info!(
        "ICE revision {:#09x}, release {}.{}, chip {:#04x}",
        id.revision, id.major, id.minor, id.chip_id
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_codes() {
        assert_eq!(link_speed_code(333).ok(), Some(1));
        assert_eq!(link_speed_code(400).ok(), Some(3));
        assert!(matches!(
            link_speed_code(250),
            Err(Error::UnsupportedClock { mhz: 250 })
        ));
    }

    #[test]
    fn setup_frame_is_six_bytes() {
        let frame = minimal_be_bytes((SETUP_COMMAND + 3) as u128);
        assert_eq!(frame, vec![0x01, 0x04, 0x00, 0x00, 0x80, 0x93]);
    }

    #[test]
    fn busy_byte_is_bits_8_to_15() {
        assert!(busy(0x0000_0100));
        assert!(busy(0x0000_FF00));
        assert!(!busy(0x001B_0004));
        assert!(!busy(0xFFFF_00FF));
    }

    #[test]
    fn training_status_lists_errors_but_not_done_bit() {
        let status = TrainingStatus((1 << 39) | (1 << 16) | 1);
        assert!(status.done());
        let errors: Vec<_> = status.errors().collect();
        assert_eq!(
            errors,
            vec![(0, "UE on control flit frame buffer"), (16, "CRC error detected")]
        );

        assert!(!TrainingStatus(0).done());
        assert_eq!(TrainingStatus(0).errors().count(), 0);
    }

    #[test]
    fn ice_id_fields() {
        // upper: clock code 3, dirty, revision 0x0ABCDEF; lower: release 2.5, chip 0x21
        let raw = (((3u64 << 29) | (1 << 28) | 0x0ABC_DEF) << 32) | 0x2500_0021;
        let id = IceId::decode(raw);
        assert_eq!(id.revision, 0x0ABC_DEF);
        assert!(id.dirty);
        assert_eq!(id.clock_code, 3);
        assert_eq!(id.clock_mhz(), 400);
        assert_eq!((id.major, id.minor), (2, 5));
        assert_eq!(id.chip_id, 0x21);

        assert_eq!(IceId::decode(0).clock_mhz(), 333);
    }

    #[test]
    fn ecid_prints_every_word_in_full() {
        let ecid = Ecid(vec![0x1, 0xABCD_0000]);
        assert_eq!(ecid.to_string(), "0x00000001abcd0000");
    }
}
