//! Common utilities and types shared across the token KMS crates.
//!
//! This module provides the error taxonomy and the typed identifiers used by
//! the codec, the key store and the update protocol.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    is_kms_key_id, now_ts, GroupId, KeyId, SensitiveBytes, UserId, KMS_KEY_ID_MAX,
    SYNC_KEY_ID_BASE,
};
