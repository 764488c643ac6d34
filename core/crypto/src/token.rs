//! Contract expected from the hardware security token.
//!
//! The KMS never handles raw key material itself: every encryption runs
//! inside a token cipher session addressed by key id, and keys move between
//! tokens only in wrapped form.

use std::fmt;
use std::sync::Arc;

use tokenkms_common::Result;

use crate::algorithm::{
    Algorithm, CipherMode, Direction, BLOCK_SIZE, DERIVATION_NONCE_SIZE, SIGNATURE_SIZE,
};

/// Authentication signature returned by an authenticated session.
pub type Signature = [u8; SIGNATURE_SIZE];

/// Role used to log in to a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRole {
    /// Regular user.
    User,
    /// Administrator.
    Admin,
}

/// Parameters for starting a cipher session.
#[derive(Clone)]
pub struct CipherParams {
    /// Token key id.
    pub key_id: u32,
    /// Algorithm the key must match.
    pub algorithm: Algorithm,
    /// Block cipher mode.
    pub mode: CipherMode,
    /// Operation direction.
    pub direction: Direction,
    /// Initialization vector or initial counter block (ignored for ECB).
    pub iv: [u8; BLOCK_SIZE],
    /// When set, the session also authenticates `iv || ciphertext` with a MAC
    /// key derived from the session key and this nonce.
    pub derivation_nonce: Option<[u8; DERIVATION_NONCE_SIZE]>,
}

impl CipherParams {
    /// Unauthenticated session parameters.
    pub fn new(key_id: u32, algorithm: Algorithm, mode: CipherMode, direction: Direction) -> Self {
        Self {
            key_id,
            algorithm,
            mode,
            direction,
            iv: [0u8; BLOCK_SIZE],
            derivation_nonce: None,
        }
    }

    /// Set the IV / initial counter block.
    pub fn with_iv(mut self, iv: [u8; BLOCK_SIZE]) -> Self {
        self.iv = iv;
        self
    }

    /// Enable authentication with the given derivation nonce.
    pub fn authenticated(mut self, derivation_nonce: [u8; DERIVATION_NONCE_SIZE]) -> Self {
        self.derivation_nonce = Some(derivation_nonce);
        self
    }
}

impl fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherParams")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("mode", &self.mode)
            .field("direction", &self.direction)
            .field("authenticated", &self.derivation_nonce.is_some())
            .finish()
    }
}

/// A streaming cipher session: init via [`CryptoToken::begin_cipher`],
/// any number of `update` calls, then `finalize`.
pub trait CipherSession {
    /// Transform `data` in place.
    ///
    /// # Errors
    /// - Block modes reject input that is not block aligned
    fn update(&mut self, data: &mut [u8]) -> Result<()>;

    /// Finish the session, returning the signature for authenticated sessions.
    fn finalize(self: Box<Self>) -> Result<Option<Signature>>;
}

/// Metadata of a key stored on the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenKeyInfo {
    /// Token key id.
    pub id: u32,
    /// Key length in bytes.
    pub length: usize,
}

/// Hardware token operations consumed by the codec and the KMS.
pub trait CryptoToken: Send + Sync {
    /// Serial number identifying the device.
    fn serial_number(&self) -> &str;

    /// Authenticate to the token.
    fn login(&self, pin: &str, role: LoginRole) -> Result<()>;

    /// Drop the current authentication.
    fn logout(&self) -> Result<()>;

    /// Role of the current login, if any.
    fn logged_in_as(&self) -> Option<LoginRole>;

    /// Fill `buf` with secure random bytes.
    fn random_bytes(&self, buf: &mut [u8]) -> Result<()>;

    /// Start a cipher session.
    fn begin_cipher(&self, params: &CipherParams) -> Result<Box<dyn CipherSession>>;

    /// Generate a fresh random key inside the token.
    fn generate_key(&self, key_id: u32, length: usize) -> Result<()>;

    /// Store raw key material under `key_id`, replacing any existing key.
    fn insert_key(&self, key_id: u32, material: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete_key(&self, key_id: u32) -> Result<()>;

    /// List stored keys.
    fn list_keys(&self) -> Result<Vec<TokenKeyInfo>>;

    /// Whether a key id is present.
    fn has_key(&self, key_id: u32) -> Result<bool> {
        Ok(self.list_keys()?.iter().any(|k| k.id == key_id))
    }

    /// Export `key_id` encrypted and authenticated under `wrapping_key_id`.
    fn export_wrapped_key(&self, key_id: u32, wrapping_key_id: u32) -> Result<Vec<u8>>;

    /// Unwrap `wrapped` with `unwrapping_key_id` and store it under `key_id`.
    fn insert_wrapped_key(&self, key_id: u32, unwrapping_key_id: u32, wrapped: &[u8]) -> Result<()>;
}

/// Information about an attached token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial_number: String,
}

/// Enumeration and selection of attached tokens.
pub trait DeviceManager {
    /// List attached devices.
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Select a device by serial number.
    fn select(&self, serial_number: &str) -> Result<Arc<dyn CryptoToken>>;
}
