//! Sector geometry and counter arithmetic.
//!
//! A file is one header sector followed by data sectors. Every data sector
//! carries `used_len u16 | padding | payload` encrypted in CTR mode, then a
//! 32-byte signature. Logical offsets count payload bytes only.

use tokenkms_common::{Error, Result};
use tokenkms_crypto::{BLOCK_SIZE, DERIVATION_NONCE_SIZE, SIGNATURE_SIZE};

/// Size of the plaintext part of the header sector.
pub const HEADER_PLAIN_SIZE: usize = 16;

/// Size of the little-endian used-length field of a data sector.
pub const USED_LEN_SIZE: usize = 2;

/// Size of the name length field inside the encrypted header.
pub const NAME_LEN_SIZE: usize = 2;

/// Fixed geometry of an encrypted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLayout {
    sector_size: usize,
    padding: usize,
}

impl SectorLayout {
    /// General purpose files: 512-byte sectors, 478 payload bytes each.
    pub const STANDARD: SectorLayout = SectorLayout {
        sector_size: 512,
        padding: 0,
    };

    /// Database backing files: 4144-byte sectors, 4096 payload bytes each.
    pub const SQL: SectorLayout = SectorLayout {
        sector_size: 4144,
        padding: 14,
    };

    /// Physical sector size.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Bytes of the encrypted region of a data sector.
    pub fn encrypted_size(&self) -> usize {
        self.sector_size - SIGNATURE_SIZE
    }

    /// Offset of the payload inside the encrypted region.
    pub fn payload_offset(&self) -> usize {
        USED_LEN_SIZE + self.padding
    }

    /// Logical bytes stored per data sector.
    pub fn payload_size(&self) -> usize {
        self.encrypted_size() - self.payload_offset()
    }

    /// Bytes of the encrypted region of the header sector.
    pub fn header_encrypted_size(&self) -> usize {
        self.sector_size - HEADER_PLAIN_SIZE - SIGNATURE_SIZE
    }

    /// Longest logical name the header can hold.
    pub fn max_name_len(&self) -> usize {
        self.header_encrypted_size() - BLOCK_SIZE - DERIVATION_NONCE_SIZE - NAME_LEN_SIZE
    }

    /// Number of cipher blocks consumed per data sector; the counter nonce of
    /// sector `i` starts `i * blocks_per_sector` blocks past the file nonce.
    pub fn blocks_per_sector(&self) -> u64 {
        self.encrypted_size().div_ceil(BLOCK_SIZE) as u64
    }

    /// Physical offset of data sector `index`.
    pub fn sector_offset(&self, index: u64) -> u64 {
        (index + 1) * self.sector_size as u64
    }

    /// Split a logical offset into data sector index and offset in payload.
    pub fn locate(&self, logical: u64) -> (u64, usize) {
        let payload = self.payload_size() as u64;
        (logical / payload, (logical % payload) as usize)
    }

    /// Number of data sectors needed for a logical length.
    pub fn sectors_for(&self, logical_len: u64) -> u64 {
        logical_len.div_ceil(self.payload_size() as u64)
    }

    /// Physical length of a file holding `logical_len` bytes.
    pub fn physical_len(&self, logical_len: u64) -> u64 {
        self.sector_offset(self.sectors_for(logical_len))
    }

    /// Absolute ciphertext offset of a logical position.
    pub fn to_physical(&self, logical: u64) -> u64 {
        let (index, within) = self.locate(logical);
        self.sector_offset(index) + (self.payload_offset() + within) as u64
    }

    /// Logical position of an absolute ciphertext offset.
    ///
    /// # Errors
    /// - Offsets inside the header sector, the length field, the padding or
    ///   the signature do not address payload bytes
    pub fn to_logical(&self, physical: u64) -> Result<u64> {
        let sector = self.sector_size as u64;
        if physical < sector {
            return Err(Error::Parameter(format!(
                "Offset {} lies inside the header sector",
                physical
            )));
        }
        let index = physical / sector - 1;
        let within = (physical % sector) as usize;
        if within < self.payload_offset() || within >= self.encrypted_size() {
            return Err(Error::Parameter(format!(
                "Offset {} does not address payload",
                physical
            )));
        }
        Ok(index * self.payload_size() as u64 + (within - self.payload_offset()) as u64)
    }
}

/// Add `offset` blocks to a big-endian 16-byte counter.
///
/// Bytes are processed from index 15 down to 0, each absorbing the next low
/// byte of the offset plus the carry, stopping as soon as both are exhausted.
/// A carry out of byte 0 is dropped.
pub fn add_counter_offset(nonce: &[u8; BLOCK_SIZE], offset: u64) -> [u8; BLOCK_SIZE] {
    let mut counter = *nonce;
    let mut remaining = offset;
    let mut carry = 0u16;
    let mut index = BLOCK_SIZE;

    while index > 0 && (remaining != 0 || carry != 0) {
        index -= 1;
        let sum = counter[index] as u16 + (remaining & 0xFF) as u16 + carry;
        counter[index] = sum as u8;
        carry = sum >> 8;
        remaining >>= 8;
    }

    counter
}
