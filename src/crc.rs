use crc::{CRC_32_ISO_HDLC, Crc};

/// CRC-32/ISO-HDLC (reflected poly 0xEDB88320, init and xorout 0xFFFFFFFF).
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC over a run of 32-bit words, each fed to the CRC most significant byte
/// first. This is how the memory buffer firmware checks both the staged data
/// of a burst and the command buffer describing it.
pub fn crc32_words(words: &[u32]) -> u32 {
    let mut digest = CRC32.digest();
    for word in words {
        digest.update(&word.to_be_bytes());
    }
    digest.finalize()
}
