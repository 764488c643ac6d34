//! Raw key material with secure memory handling.
//!
//! Only token implementations hold raw key bytes. The material is zeroized on
//! drop and never printed.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tokenkms_common::Result;

use crate::algorithm::Algorithm;

/// Raw symmetric key held by a token.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create key material from raw bytes.
    ///
    /// # Errors
    /// - Returns error if the length matches no supported algorithm
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Algorithm::from_key_len(bytes.len())?;
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Generate random key material of the given length.
    pub fn generate(length: usize) -> Result<Self> {
        use rand::RngCore;
        Algorithm::from_key_len(length)?;
        let mut bytes = vec![0u8; length];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Ok(Self { bytes })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Algorithm implied by the key length.
    pub fn algorithm(&self) -> Result<Algorithm> {
        Algorithm::from_key_len(self.bytes.len())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED; {} bytes])", self.bytes.len())
    }
}
