use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Bytes per firmware burst.
pub const BURST_BYTES: usize = 256;
/// 64-bit words per burst.
pub const WORDS_PER_BURST: usize = BURST_BYTES / 8;
/// Filler for the unused tail of the last burst.
pub const PAD_WORD: u64 = u64::MAX;

/// A firmware binary, segmented into 256-byte bursts of 8-byte words.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::EmptyImage);
        }
        Ok(Self { data })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::new(fs::read(path)?)
    }

    /// Logical size, padding excluded.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bursts completely filled by the image.
    pub fn full_bursts(&self) -> usize {
        self.data.len() / BURST_BYTES
    }

    /// `0xFF` bytes appended to reach the next 256-byte boundary.
    pub fn padding(&self) -> usize {
        match self.data.len() % BURST_BYTES {
            0 => 0,
            rest => BURST_BYTES - rest,
        }
    }

    /// Bursts transferred, the padded one included.
    pub fn burst_count(&self) -> usize {
        self.data.len().div_ceil(BURST_BYTES)
    }

    /// Bursts of 32 little-endian words, the last one padded with
    /// [`PAD_WORD`] (a short final word is filled with `0xFF` bytes).
    pub fn bursts(&self) -> impl Iterator<Item = [u64; WORDS_PER_BURST]> + '_ {
        self.data.chunks(BURST_BYTES).map(|chunk| {
            let mut burst = [PAD_WORD; WORDS_PER_BURST];
            for (slot, bytes) in burst.iter_mut().zip(chunk.chunks(8)) {
                let mut word = [0xFFu8; 8];
                word[..bytes.len()].copy_from_slice(bytes);
                *slot = u64::from_le_bytes(word);
            }
            burst
        })
    }
}

/// Low and high 32-bit halves of a staged word, in transfer order.
pub fn split_word(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}
