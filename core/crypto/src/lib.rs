//! Token contract and cryptographic primitives for the token KMS.
//!
//! This module provides:
//! - The [`CryptoToken`] contract every device implementation satisfies
//! - Algorithm and cipher mode identifiers shared with the sector format
//! - Key material with automatic zeroization
//! - [`SoftToken`], an in-memory token backed by RustCrypto AES
//!
//! # Security Guarantees
//! - Raw key material only lives inside token implementations
//! - No key material is ever logged
//! - Signatures and PINs are compared in constant time

pub mod algorithm;
pub mod keys;
pub mod soft;
pub mod token;

pub use algorithm::{
    Algorithm, CipherMode, Direction, BLOCK_SIZE, DERIVATION_NONCE_SIZE, SIGNATURE_SIZE,
};
pub use keys::KeyMaterial;
pub use soft::{SoftDeviceManager, SoftToken};
pub use token::{
    CipherParams, CipherSession, CryptoToken, DeviceInfo, DeviceManager, LoginRole, Signature,
    TokenKeyInfo,
};
