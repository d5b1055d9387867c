//! Optional-header `CheckSum` computation.
//!
//! Firmware loaders ignore the field, but kernel-mode images and some
//! signing tools verify it, so a rewritten image can carry a fresh value.

use super::parser::PeFile;

/// Compute the PE checksum of `data`, treating the four bytes at
/// `checksum_offset` as zero.
///
/// Little-endian dwords are summed with end-around carry, folded to 16 bits
/// and the file length is added.  A trailing partial dword is zero-padded.
pub fn compute(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let field = checksum_offset..checksum_offset.saturating_add(4);
    for (i, chunk) in data.chunks(4).enumerate() {
        let mut dword = [0u8; 4];
        dword[..chunk.len()].copy_from_slice(chunk);
        for (j, byte) in dword.iter_mut().enumerate() {
            if field.contains(&(i * 4 + j)) {
                *byte = 0;
            }
        }
        sum = (sum & 0xFFFF_FFFF) + u32::from_le_bytes(dword) as u64 + (sum >> 32);
        if sum > u32::MAX as u64 {
            sum = (sum & 0xFFFF_FFFF) + (sum >> 32);
        }
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    sum += sum >> 16;
    sum &= 0xFFFF;
    (sum as u32).wrapping_add(data.len() as u32)
}

impl PeFile {
    /// Checksum of the current raw buffer.
    pub fn compute_checksum(&self) -> u32 {
        compute(&self.data, self.checksum_offset())
    }

    /// `true` when the stored checksum matches the buffer.
    pub fn checksum_is_valid(&self) -> bool {
        self.optional_header.checksum == self.compute_checksum()
    }
}

/// Patch the checksum field of an already-serialized image in place.
pub fn update_in_place(data: &mut [u8], checksum_offset: usize) -> Option<u32> {
    if checksum_offset + 4 > data.len() {
        return None;
    }
    let checksum = compute(data, checksum_offset);
    data[checksum_offset..checksum_offset + 4].copy_from_slice(&checksum.to_le_bytes());
    Some(checksum)
}
