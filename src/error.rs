//! Error types for register transactions and firmware upload

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for register and upload operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised above the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// The channel failed, either twice in a row or with a non-transient fault
    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    /// A read came back with the hardware's "not mapped" sentinel
    #[error("register {address:#010x} is not mapped yet (read {sentinel:#010x})")]
    NotMapped {
        /// Logical register address
        address: u64,
        /// Sentinel value returned by the device
        sentinel: u64,
    },

    /// The device never reported ready within the poll budget
    #[error(
        "burst {burst}: register {register:#010x} not ready after {attempts} attempts (last value {last:#x})"
    )]
    ReadyTimeout {
        /// Burst index being processed (equals the burst count during commit)
        burst: usize,
        /// Polled register
        register: u64,
        /// Number of reads issued
        attempts: u32,
        /// Last value read
        last: u64,
    },

    /// Mid-transfer status check saw a non-zero low byte
    #[error("burst {burst}: sanity status {status:#x} reports a rejected transfer")]
    SanityCheck {
        /// Burst index after which the check ran
        burst: usize,
        /// Raw status register value
        status: u64,
    },

    /// Final status check did not report a completed upload
    #[error("burst {burst}: upload not accepted, final status {status:#x}")]
    UploadIncomplete {
        /// Burst index of the commit (equals the burst count)
        burst: usize,
        /// Raw status register value
        status: u64,
    },

    /// Any other failure during an upload, tagged with the burst in flight
    #[error("upload aborted at burst {burst}: {source}")]
    Upload {
        /// Burst index being processed (equals the burst count during commit)
        burst: usize,
        #[source]
        source: Box<Error>,
    },

    /// A read hit an address inside the bus window that no hardware backs
    #[error("register {address:#010x} is outside the hardware range (read {sentinel:#010x})")]
    OutOfRange {
        /// Logical register address
        address: u64,
        /// Sentinel value returned by the device
        sentinel: u64,
    },

    /// The memory buffer stayed busy after the OMI setup command
    #[error("link setup still busy after {attempts} status reads (last {last:#010x})")]
    InitTimeout {
        /// Number of status reads issued
        attempts: u32,
        /// Last status value
        last: u64,
    },

    /// Link clock the memory buffer cannot be set up for
    #[error("unsupported link clock {mhz} MHz, expected 333 or 400")]
    UnsupportedClock {
        /// Requested clock in MHz
        mhz: u32,
    },

    /// The selected persona has no status register to poll
    #[error("{persona} frames have no status register")]
    NoStatusRegister {
        /// Frame format name
        persona: &'static str,
    },

    /// Nothing to upload
    #[error("firmware image is empty")]
    EmptyImage,

    /// A frame could not be built or decoded
    #[error("frame error: {reason}")]
    Frame {
        /// What went wrong
        reason: String,
    },

    /// File access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sequence file could not be parsed
    #[error("sequence parse error: {0}")]
    Sequence(#[from] serde_json::Error),

    /// A hex literal could not be parsed
    #[error("invalid hex value '{0}'")]
    InvalidHex(String),
}

impl Error {
    /// Create a frame error
    pub fn frame(reason: impl Into<String>) -> Self {
        Self::Frame {
            reason: reason.into(),
        }
    }

    /// Burst index an upload failure happened at, if any
    pub fn burst(&self) -> Option<usize> {
        match self {
            Self::ReadyTimeout { burst, .. }
            | Self::SanityCheck { burst, .. }
            | Self::UploadIncomplete { burst, .. }
            | Self::Upload { burst, .. } => Some(*burst),
            _ => None,
        }
    }
}
