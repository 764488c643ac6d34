//! File header sector.
//!
//! Layout: `key_id u32 | algorithm u16 | reserved 10` in plaintext, then the
//! CBC-encrypted region `ctr_nonce[16] | derivation_nonce[32] | name_len u16 |
//! name | zero fill`, then the signature of that region.

use tokenkms_common::{Error, Result};
use tokenkms_crypto::{
    Algorithm, CipherMode, CipherParams, CryptoToken, Direction, BLOCK_SIZE,
    DERIVATION_NONCE_SIZE,
};

use crate::layout::{SectorLayout, HEADER_PLAIN_SIZE, NAME_LEN_SIZE};
use crate::sector::{run_session, verify_signature};

// Unsigned plaintext bytes after the key id and algorithm must stay zero.
const RESERVED_START: usize = 6;

/// Decoded header of an encrypted file.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Token key id encrypting the file.
    pub key_id: u32,
    /// Algorithm of that key.
    pub algorithm: Algorithm,
    /// Initial counter block of data sector 0.
    pub ctr_nonce: [u8; BLOCK_SIZE],
    /// Nonce for deriving the per-file signature key.
    pub derivation_nonce: [u8; DERIVATION_NONCE_SIZE],
    /// Logical file name.
    pub name: String,
}

impl std::fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHeader")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn header_params(key_id: u32, algorithm: Algorithm, direction: Direction) -> CipherParams {
    CipherParams::new(key_id, algorithm, CipherMode::Cbc, direction)
        .authenticated([0u8; DERIVATION_NONCE_SIZE])
}

impl FileHeader {
    /// Create a header with fresh nonces drawn from the token.
    ///
    /// # Errors
    /// - Name longer than the layout allows
    pub fn generate(
        token: &dyn CryptoToken,
        layout: &SectorLayout,
        key_id: u32,
        algorithm: Algorithm,
        name: &str,
    ) -> Result<Self> {
        if name.len() > layout.max_name_len() {
            return Err(Error::Parameter(format!(
                "Name of {} bytes exceeds {}",
                name.len(),
                layout.max_name_len()
            )));
        }
        let mut ctr_nonce = [0u8; BLOCK_SIZE];
        let mut derivation_nonce = [0u8; DERIVATION_NONCE_SIZE];
        token.random_bytes(&mut ctr_nonce)?;
        token.random_bytes(&mut derivation_nonce)?;
        Ok(Self {
            key_id,
            algorithm,
            ctr_nonce,
            derivation_nonce,
            name: name.to_string(),
        })
    }

    /// Read the plaintext key id and algorithm of a header sector.
    ///
    /// # Errors
    /// - Sector shorter than the plaintext part
    /// - Unknown algorithm id
    pub fn peek(sector: &[u8]) -> Result<(u32, Algorithm)> {
        if sector.len() < HEADER_PLAIN_SIZE {
            return Err(Error::Integrity("Header sector is truncated".to_string()));
        }
        let key_id = u32::from_le_bytes([sector[0], sector[1], sector[2], sector[3]]);
        let algorithm = Algorithm::from_id(u16::from_le_bytes([sector[4], sector[5]]))
            .map_err(|e| Error::Integrity(format!("Corrupt header: {}", e)))?;
        if sector[RESERVED_START..HEADER_PLAIN_SIZE].iter().any(|&b| b != 0) {
            return Err(Error::Integrity("Header reserved bytes are not zero".to_string()));
        }
        Ok((key_id, algorithm))
    }

    /// Encrypt and sign the header into a full sector.
    pub fn seal(&self, token: &dyn CryptoToken, layout: &SectorLayout) -> Result<Vec<u8>> {
        let mut sector = vec![0u8; layout.sector_size()];
        sector[0..4].copy_from_slice(&self.key_id.to_le_bytes());
        sector[4..6].copy_from_slice(&self.algorithm.id().to_le_bytes());

        let region_end = HEADER_PLAIN_SIZE + layout.header_encrypted_size();
        {
            let region = &mut sector[HEADER_PLAIN_SIZE..region_end];
            let mut at = 0;
            region[at..at + BLOCK_SIZE].copy_from_slice(&self.ctr_nonce);
            at += BLOCK_SIZE;
            region[at..at + DERIVATION_NONCE_SIZE].copy_from_slice(&self.derivation_nonce);
            at += DERIVATION_NONCE_SIZE;
            let name = self.name.as_bytes();
            region[at..at + NAME_LEN_SIZE].copy_from_slice(&(name.len() as u16).to_le_bytes());
            at += NAME_LEN_SIZE;
            region[at..at + name.len()].copy_from_slice(name);
        }

        let params = header_params(self.key_id, self.algorithm, Direction::Encrypt);
        let signature = run_session(token, &params, &mut sector[HEADER_PLAIN_SIZE..region_end])?
            .ok_or_else(|| Error::Crypto("Token returned no signature".to_string()))?;
        sector[region_end..].copy_from_slice(&signature);
        Ok(sector)
    }

    /// Decrypt and verify a header sector.
    ///
    /// # Errors
    /// - `Error::Integrity` if the signature or the name field is invalid
    pub fn open(token: &dyn CryptoToken, layout: &SectorLayout, mut sector: Vec<u8>) -> Result<Self> {
        if sector.len() != layout.sector_size() {
            return Err(Error::Integrity("Header sector is truncated".to_string()));
        }
        let (key_id, algorithm) = Self::peek(&sector)?;

        let region_end = HEADER_PLAIN_SIZE + layout.header_encrypted_size();
        let (head, stored) = sector.split_at_mut(region_end);
        let region = &mut head[HEADER_PLAIN_SIZE..];
        let params = header_params(key_id, algorithm, Direction::Decrypt);
        let computed = run_session(token, &params, region)?;
        verify_signature(computed, stored, "header")?;

        let mut ctr_nonce = [0u8; BLOCK_SIZE];
        let mut derivation_nonce = [0u8; DERIVATION_NONCE_SIZE];
        let mut at = 0;
        ctr_nonce.copy_from_slice(&region[at..at + BLOCK_SIZE]);
        at += BLOCK_SIZE;
        derivation_nonce.copy_from_slice(&region[at..at + DERIVATION_NONCE_SIZE]);
        at += DERIVATION_NONCE_SIZE;
        let name_len = u16::from_le_bytes([region[at], region[at + 1]]) as usize;
        at += NAME_LEN_SIZE;
        if name_len > layout.max_name_len() {
            return Err(Error::Integrity(format!("Header name length {} is invalid", name_len)));
        }
        let name = String::from_utf8(region[at..at + name_len].to_vec())
            .map_err(|_| Error::Integrity("Header name is not UTF-8".to_string()))?;

        Ok(Self {
            key_id,
            algorithm,
            ctr_nonce,
            derivation_nonce,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenkms_crypto::{LoginRole, SoftToken};

    fn token() -> SoftToken {
        let token = SoftToken::new("SN-H", "1111", "2222");
        token.login("1111", LoginRole::User).unwrap();
        token.generate_key(7, 32).unwrap();
        token
    }

    #[test]
    fn test_header_roundtrip() {
        let token = token();
        let layout = SectorLayout::STANDARD;
        let header = FileHeader::generate(&token, &layout, 7, Algorithm::Aes256, "report.txt").unwrap();

        let sector = header.seal(&token, &layout).unwrap();
        assert_eq!(sector.len(), 512);
        assert_eq!(FileHeader::peek(&sector).unwrap(), (7, Algorithm::Aes256));
        // name is not visible in the ciphertext
        assert!(!sector.windows(10).any(|w| w == b"report.txt"));

        let opened = FileHeader::open(&token, &layout, sector).unwrap();
        assert_eq!(opened, header);
    }

    #[test]
    fn test_header_tamper_detected() {
        let token = token();
        let layout = SectorLayout::SQL;
        let header = FileHeader::generate(&token, &layout, 7, Algorithm::Aes256, "db").unwrap();
        let mut sector = header.seal(&token, &layout).unwrap();
        sector[100] ^= 0x01;
        assert!(matches!(
            FileHeader::open(&token, &layout, sector),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_reserved_plaintext_bytes_checked() {
        let token = token();
        let layout = SectorLayout::STANDARD;
        let header = FileHeader::generate(&token, &layout, 7, Algorithm::Aes256, "r").unwrap();
        let mut sector = header.seal(&token, &layout).unwrap();
        sector[HEADER_PLAIN_SIZE - 1] = 0x01;
        assert!(matches!(FileHeader::peek(&sector), Err(Error::Integrity(_))));
        assert!(matches!(
            FileHeader::open(&token, &layout, sector),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_name_too_long() {
        let token = token();
        let layout = SectorLayout::STANDARD;
        let name = "x".repeat(layout.max_name_len() + 1);
        assert!(FileHeader::generate(&token, &layout, 7, Algorithm::Aes256, &name).is_err());
    }
}
