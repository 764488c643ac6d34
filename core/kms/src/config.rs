//! KMS configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tokenkms_common::{is_kms_key_id, Error, Result};
use tokenkms_crypto::Algorithm;

use crate::retry::RetryPolicy;

/// Role a session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Administrator: owns the master store and distributes updates.
    Admin,
    /// User device: replays updates into its local store.
    User,
}

/// Default validity gate cache lifetime.
pub const DEFAULT_GATE_TTL: Duration = Duration::from_secs(5);

/// Configuration of a KMS session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsConfig {
    /// Path of the encrypted database image.
    pub db_path: PathBuf,
    /// Manually provisioned token key encrypting the database image.
    pub db_key_id: u32,
    /// Algorithm of the database key.
    pub db_algorithm: Algorithm,
    /// Shared directory holding update files.
    pub update_dir: PathBuf,
    /// Manually provisioned key shared by the admin token and every device,
    /// used to transfer synchronization keys at provisioning time.
    pub transfer_key_id: u32,
    /// Session role.
    pub role: Role,
    /// Lifetime of cached validity checks, in milliseconds.
    pub gate_ttl_ms: u64,
    /// Retry limits.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Default transfer key id.
pub const DEFAULT_TRANSFER_KEY_ID: u32 = 0xF000_0000;

impl KmsConfig {
    /// Configuration for a session in `role`.
    pub fn new(
        db_path: impl Into<PathBuf>,
        db_key_id: u32,
        update_dir: impl Into<PathBuf>,
        role: Role,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            db_key_id,
            db_algorithm: Algorithm::Aes256,
            update_dir: update_dir.into(),
            transfer_key_id: DEFAULT_TRANSFER_KEY_ID,
            role,
            gate_ttl_ms: DEFAULT_GATE_TTL.as_millis() as u64,
            retry: RetryPolicy::default(),
        }
    }

    /// Administrator configuration.
    pub fn admin(db_path: impl Into<PathBuf>, db_key_id: u32, update_dir: impl Into<PathBuf>) -> Self {
        Self::new(db_path, db_key_id, update_dir, Role::Admin)
    }

    /// Device configuration.
    pub fn user(db_path: impl Into<PathBuf>, db_key_id: u32, update_dir: impl Into<PathBuf>) -> Self {
        Self::new(db_path, db_key_id, update_dir, Role::User)
    }

    /// Set the gate cache lifetime.
    pub fn with_gate_ttl(mut self, ttl: Duration) -> Self {
        self.gate_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the database key algorithm.
    pub fn with_db_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.db_algorithm = algorithm;
        self
    }

    /// Set the transfer key id.
    pub fn with_transfer_key(mut self, key_id: u32) -> Self {
        self.transfer_key_id = key_id;
        self
    }

    /// Gate cache lifetime.
    pub fn gate_ttl(&self) -> Duration {
        Duration::from_millis(self.gate_ttl_ms)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// - Database or transfer key inside the KMS-managed id range
    /// - Invalid retry limits
    pub fn validate(&self) -> Result<()> {
        for (what, id) in [("database", self.db_key_id), ("transfer", self.transfer_key_id)] {
            if id == 0 || is_kms_key_id(id) {
                return Err(Error::Parameter(format!(
                    "The {} key id {:#x} must be a manually provisioned id",
                    what, id
                )));
            }
        }
        self.retry.validate()
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}
