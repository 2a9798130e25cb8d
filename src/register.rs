use std::fmt;

/// Bit marking a 64-bit ("wide") register in the memory buffer's logical map.
pub const WIDE_FLAG: u64 = 1 << 27;

/// Logical register address as software sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress(pub u64);

/// Address as understood by the device's internal register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl RegisterAddress {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Wide registers hold 64 bits split over two consecutive narrow slots.
    pub const fn is_wide(self) -> bool {
        self.0 & WIDE_FLAG != 0
    }

    /// Map to the device's register file.
    ///
    /// Wide registers are addressed 8 times more coarsely in the logical map:
    /// clear the flag, shift left by 3, then set the flag again. Narrow
    /// registers map to themselves.
    pub const fn physical(self) -> PhysicalAddress {
        if self.is_wide() {
            PhysicalAddress(((self.0 & !WIDE_FLAG) << 3) | WIDE_FLAG)
        } else {
            PhysicalAddress(self.0)
        }
    }

    /// Physical slots holding the MSB and LSB halves of a wide register.
    pub const fn halves(self) -> (PhysicalAddress, PhysicalAddress) {
        let msb = self.physical();
        (msb, msb.offset(4))
    }

    /// Address `bytes` further into the logical map.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl PhysicalAddress {
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A physical address is already mapped; this is the identity.
    pub const fn physical(self) -> PhysicalAddress {
        self
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl From<u64> for RegisterAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Outcome of a register read.
///
/// Some registers only come alive after initialization; until then the
/// hardware answers with a sentinel that must not be confused with content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readout {
    Value(u64),
    Unmapped { sentinel: u64 },
}

impl Readout {
    pub fn value(self) -> Option<u64> {
        match self {
            Readout::Value(v) => Some(v),
            Readout::Unmapped { .. } => None,
        }
    }

    /// Whatever the device returned, sentinel included.
    pub fn raw(self) -> u64 {
        match self {
            Readout::Value(v) => v,
            Readout::Unmapped { sentinel } => sentinel,
        }
    }

    pub fn is_unmapped(self) -> bool {
        matches!(self, Readout::Unmapped { .. })
    }

    /// Turn an unmapped readout into [`crate::Error::NotMapped`].
    pub fn into_value(self, address: RegisterAddress) -> crate::Result<u64> {
        match self {
            Readout::Value(v) => Ok(v),
            Readout::Unmapped { sentinel } => Err(crate::Error::NotMapped {
                address: address.raw(),
                sentinel,
            }),
        }
    }
}

/// Memory-buffer firmware register catalog.
pub mod explorer {
    use super::RegisterAddress;

    /// Rotating window receiving the 64 data halves of a burst.
    pub const STAGING_WINDOW: RegisterAddress = RegisterAddress(0x0102_FF00);
    /// Window receiving the 16 command buffer words.
    pub const COMMAND_WINDOW: RegisterAddress = RegisterAddress(0x0103_FF40);
    /// Upload status; low byte zero while bursts are accepted.
    pub const SANITY_STATUS: RegisterAddress = RegisterAddress(0x0103_FF20);
    /// Outbound (device to host) doorbell. Reads 1 when a response is ready,
    /// writing 1 clears it.
    pub const OUTBOUND_DOORBELL: RegisterAddress = RegisterAddress(0x0000_2058);
    /// Inbound (host to device) doorbell, set side.
    pub const INBOUND_DOORBELL_SET: RegisterAddress = RegisterAddress(0x0801_08E6);
    /// Inbound doorbell, clear side.
    pub const INBOUND_DOORBELL_CLEAR: RegisterAddress = RegisterAddress(0x0801_08E7);

    /// Enterprise-mode status.
    pub const ENTERPRISE_MODE: RegisterAddress = RegisterAddress(0x0020_B080);
    /// Lowest and highest word of the electronic chip id.
    pub const ECID_LOW: RegisterAddress = RegisterAddress(0x0020_B090);
    pub const ECID_HIGH: RegisterAddress = RegisterAddress(0x0020_B0C4);
    /// Card identification number.
    pub const CARD_ID: RegisterAddress = RegisterAddress(0x0209_0000);
    /// Data-link error and training status (DL0 error hold).
    pub const TRAINING_STATUS: RegisterAddress = RegisterAddress(0x0801_2813);
    pub const TRAINING_DONE: u64 = 1 << 39;

    pub const DOORBELL_BIT: u64 = 0x8000_0000_0000_0000;
    pub const RESPONSE_READY: u64 = 0x1;
    pub const UPLOAD_COMPLETE: u64 = 0x4C00;

    /// Command buffer asking the firmware to publish [`FIRMWARE_INFO`],
    /// as captured from a working session (its trailing word is taken
    /// verbatim, not recomputed).
    pub const INFO_REQUEST: [u32; 16] = [
        0x4241_0007, 0, 0xFFFF_FFFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x3932_F901,
    ];

    /// Firmware metadata, readable once the firmware answered an info request.
    pub const FIRMWARE_INFO: &[(RegisterAddress, &str)] = &[
        (RegisterAddress(0x0102_FF00), "FW number of images"),
        (RegisterAddress(0x0102_FF04), "Partition ID"),
        (RegisterAddress(0x0102_FF08), "Major (boot partition A)"),
        (RegisterAddress(0x0102_FF0C), "Minor (boot partition A)"),
        (RegisterAddress(0x0102_FF10), "Build patch (boot partition A)"),
        (RegisterAddress(0x0102_FF14), "Build number (boot partition A)"),
        (RegisterAddress(0x0102_FF18), "Build date (boot partition A)"),
        (RegisterAddress(0x0102_FF1C), "Major (boot partition B)"),
        (RegisterAddress(0x0102_FF20), "Minor (boot partition B)"),
        (RegisterAddress(0x0102_FF24), "Build patch (boot partition B)"),
        (RegisterAddress(0x0102_FF28), "Build number (boot partition B)"),
        (RegisterAddress(0x0102_FF2C), "Build date (boot partition B)"),
        (RegisterAddress(0x0102_FF30), "RAM size (bytes)"),
        (RegisterAddress(0x0102_FF34), "Chip version"),
        (RegisterAddress(0x0102_FF38), "SPI flash ID"),
        (RegisterAddress(0x0102_FF3C), "SPI flash sector size"),
        (RegisterAddress(0x0102_FF40), "SPI flash size"),
        (RegisterAddress(0x0102_FF44), "Error buffer size"),
        (RegisterAddress(0x0102_FF48), "Image index"),
    ];
}

/// Traffic-generator FPGA register catalog.
pub mod fpga {
    use super::RegisterAddress;

    /// Bitstream revision, dirty flag and clock code.
    pub const VERSION: RegisterAddress = RegisterAddress(0x0100_0000_0000_0000);
}
