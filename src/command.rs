use crate::crc::crc32_words;

pub const COMMAND_WORDS: usize = 16;

/// Opcode/flags field for a data burst (low half of word 0).
const REGULAR_OPCODE: u32 = 0x0108;
/// Opcode/flags field for the final commit (low half of word 0).
const COMMIT_OPCODE: u32 = 0x0008;
/// Burst length marker: bytes per burst.
const REGULAR_LENGTH: u32 = 0x0000_0100;
/// Destination descriptor of a regular burst.
const REGULAR_TARGET: u32 = 0x0AED_2801;
/// "No data" CRC placeholder of the commit buffer.
const COMMIT_NO_DATA: u32 = 0xFFFF_FFFF;
/// Commit status field.
const COMMIT_STATUS: u32 = 0x0000_0002;

/// Sixteen-word metadata block that accompanies each staged burst.
///
/// The last word always holds the CRC of the fifteen words before it and is
/// written by [`CommandBuffer::seal`] after every other field is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    words: [u32; COMMAND_WORDS],
}

impl CommandBuffer {
    /// Buffer describing a data burst.
    pub fn regular(id: u16, burst_index: usize, data_crc: u32) -> Self {
        let mut words = [0u32; COMMAND_WORDS];
        words[0] = ((id as u32) << 16) | REGULAR_OPCODE;
        words[1] = REGULAR_LENGTH;
        words[2] = data_crc;
        words[8] = REGULAR_TARGET;
        words[9] = (burst_index as u32) & 0xFFF;
        Self { words }.seal()
    }

    /// Buffer telling the firmware the image is complete.
    pub fn commit(id: u16) -> Self {
        let mut words = [0u32; COMMAND_WORDS];
        words[0] = ((id as u32) << 16) | COMMIT_OPCODE;
        words[2] = COMMIT_NO_DATA;
        words[8] = COMMIT_STATUS;
        Self { words }.seal()
    }

    fn seal(mut self) -> Self {
        self.words[COMMAND_WORDS - 1] = crc32_words(&self.words[..COMMAND_WORDS - 1]);
        self
    }

    pub fn words(&self) -> &[u32; COMMAND_WORDS] {
        &self.words
    }

    pub fn id(&self) -> u16 {
        (self.words[0] >> 16) as u16
    }

    pub fn is_commit(&self) -> bool {
        self.words[0] & 0xFFFF == COMMIT_OPCODE
    }

    /// Check the trailing CRC against the other fifteen words.
    pub fn is_sealed(&self) -> bool {
        self.words[COMMAND_WORDS - 1] == crc32_words(&self.words[..COMMAND_WORDS - 1])
    }
}
