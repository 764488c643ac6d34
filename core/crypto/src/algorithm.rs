//! Symmetric algorithms and cipher modes understood by the token.

use serde::{Deserialize, Serialize};

use tokenkms_common::{Error, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Size of the authentication signature produced by authenticated sessions.
pub const SIGNATURE_SIZE: usize = 32;

/// Size of the per-file key derivation nonce.
pub const DERIVATION_NONCE_SIZE: usize = 32;

/// Symmetric key algorithm.
///
/// Variants are declared weakest first so the derived ordering ranks
/// algorithms by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// AES with a 128-bit key.
    Aes128,
    /// AES with a 192-bit key.
    Aes192,
    /// AES with a 256-bit key.
    Aes256,
}

impl Algorithm {
    /// Numeric id stored in sector headers and in the key store.
    pub fn id(&self) -> u16 {
        match self {
            Algorithm::Aes128 => 1,
            Algorithm::Aes192 => 2,
            Algorithm::Aes256 => 3,
        }
    }

    /// Resolve a numeric algorithm id.
    ///
    /// # Errors
    /// - Returns error if the id is unknown
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            1 => Ok(Algorithm::Aes128),
            2 => Ok(Algorithm::Aes192),
            3 => Ok(Algorithm::Aes256),
            other => Err(Error::Parameter(format!("Unknown algorithm id {}", other))),
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Algorithm::Aes128 => 16,
            Algorithm::Aes192 => 24,
            Algorithm::Aes256 => 32,
        }
    }

    /// Resolve the algorithm for a raw key length.
    pub fn from_key_len(len: usize) -> Result<Self> {
        match len {
            16 => Ok(Algorithm::Aes128),
            24 => Ok(Algorithm::Aes192),
            32 => Ok(Algorithm::Aes256),
            other => Err(Error::Parameter(format!("Unsupported key length {}", other))),
        }
    }
}

/// Block cipher mode of a token cipher session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    /// Electronic codebook; input must be block aligned.
    Ecb,
    /// Cipher block chaining; input must be block aligned.
    Cbc,
    /// Big-endian 128-bit counter mode; any input length.
    Ctr,
}

/// Direction of a cipher operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Plaintext to ciphertext.
    Encrypt,
    /// Ciphertext to plaintext.
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_strength_order() {
        assert!(Algorithm::Aes256 > Algorithm::Aes192);
        assert!(Algorithm::Aes192 > Algorithm::Aes128);
    }

    #[test]
    fn test_algorithm_ids() {
        for alg in [Algorithm::Aes128, Algorithm::Aes192, Algorithm::Aes256] {
            assert_eq!(Algorithm::from_id(alg.id()).unwrap(), alg);
            assert_eq!(Algorithm::from_key_len(alg.key_len()).unwrap(), alg);
        }
        assert!(Algorithm::from_id(0).is_err());
        assert!(Algorithm::from_key_len(20).is_err());
    }
}
