//! KMS sessions.
//!
//! A session is the explicit context every operation runs in: the role, the
//! opened store, the token, the validity gate cache and whether the session
//! must be restarted.

use std::cell::Cell;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use tokenkms_codec::{
    EncryptedFile, FileMedium, KeyGate, NewFile, OpenMode, SectorCodec, SectorLayout,
};
use tokenkms_common::{now_ts, Error, GroupId, KeyId, Result, UserId};
use tokenkms_crypto::{CryptoToken, Direction, LoginRole};

use crate::admin::{AdminOps, DeviceProvisioning};
use crate::config::{KmsConfig, Role};
use crate::gate::{GateCache, ValidityGate};
use crate::model::KeyRow;
use crate::selection::{self, Selection};
use crate::store::KeyStore;
use crate::update::{self, ReplayReport};

/// Session handle for tracking open sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generate a new unique session handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// An open KMS session.
pub struct Session {
    handle: SessionHandle,
    config: KmsConfig,
    token: Arc<dyn CryptoToken>,
    store: KeyStore,
    gate_cache: GateCache,
    poisoned: Cell<bool>,
}

impl Session {
    /// Open a session on an authenticated token.
    ///
    /// # Preconditions
    /// - The token is logged in; administrator sessions need an
    ///   administrator login
    /// - The database key is present on the token
    ///
    /// # Postconditions
    /// - The store is open and token key material matches it
    ///
    /// # Errors
    /// - `Error::Authorization` if the token login does not fit the role
    /// - `Error::Parameter` if the configuration is inconsistent
    /// - Store open failures
    pub fn open(config: KmsConfig, token: Arc<dyn CryptoToken>) -> Result<Self> {
        config.validate()?;
        match (config.role, token.logged_in_as()) {
            (Role::Admin, Some(LoginRole::Admin)) | (Role::User, Some(_)) => {}
            (role, login) => {
                return Err(Error::Authorization(format!(
                    "A {:?} session cannot run on a token logged in as {:?}",
                    role, login
                )))
            }
        }

        let store = KeyStore::open(&config, token.clone())?;
        store.reconcile_token()?;
        let session = Self {
            handle: SessionHandle::new(),
            gate_cache: GateCache::new(config.gate_ttl()),
            config,
            token,
            store,
            poisoned: Cell::new(false),
        };
        info!(
            session = session.handle.as_str(),
            role = ?session.config.role,
            serial = session.token.serial_number(),
            "Session opened"
        );
        Ok(session)
    }

    /// Get the session handle.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Get the configuration.
    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    /// Role of this session.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// The key store.
    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// The token.
    pub fn token(&self) -> &dyn CryptoToken {
        self.token.as_ref()
    }

    /// Whether a persistence failure requires reopening the session.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get()
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.get() {
            return Err(Error::RestartRequired(
                "The session lost track of the persisted store".to_string(),
            ));
        }
        Ok(())
    }

    fn require(&self, role: Role) -> Result<()> {
        self.ensure_usable()?;
        if self.config.role != role {
            return Err(Error::Authorization(format!(
                "Operation requires a {:?} session",
                role
            )));
        }
        Ok(())
    }

    /// Persist a committed change and refresh derived state.
    ///
    /// # Errors
    /// - `Error::RestartRequired` if the image could not be written; the
    ///   session is poisoned
    pub(crate) fn after_commit(&self) -> Result<()> {
        self.gate_cache.clear();
        if let Err(e) = self.store.persist() {
            error!(error = %e, "Committed change could not be persisted");
            self.poisoned.set(true);
            return Err(Error::RestartRequired(format!(
                "Persisting the store failed: {}",
                e
            )));
        }
        self.store.reconcile_token()?;
        Ok(())
    }

    /// Validity gate over this session's store.
    pub fn gate(&self) -> ValidityGate<'_> {
        ValidityGate::new(&self.store, &self.gate_cache)
    }

    /// Drop cached validity results.
    pub fn invalidate_gate(&self) {
        self.gate_cache.clear();
    }

    /// Deactivate keys inside the expiry margin.
    pub fn sweep_expired(&self) -> Result<Vec<KeyId>> {
        self.ensure_usable()?;
        let swept = self.store.sweep_expired(&self.config.retry, now_ts())?;
        if !swept.is_empty() {
            self.after_commit()?;
        }
        Ok(swept)
    }

    /// Administrator operations.
    ///
    /// # Errors
    /// - `Error::Authorization` in a user session
    pub fn admin(&self) -> Result<AdminOps<'_>> {
        self.require(Role::Admin)?;
        Ok(AdminOps::new(self))
    }

    /// Best key for `sender` to share with `receiver`.
    pub fn find_key_v1(&self, sender: UserId, receiver: UserId) -> Result<Option<KeyRow>> {
        self.sweep_expired()?;
        selection::find_key_v1(&self.store, sender, receiver)
    }

    /// Best key for `sender` to share with a group.
    pub fn find_key_v2(&self, sender: UserId, group: GroupId) -> Result<Option<KeyRow>> {
        self.sweep_expired()?;
        selection::find_key_v2(&self.store, sender, group)
    }

    /// Best key for `sender` to share with several receivers.
    pub fn find_key_v3(&self, sender: UserId, receivers: &[UserId]) -> Result<Selection> {
        self.sweep_expired()?;
        selection::find_key_v3(&self.store, sender, receivers)
    }

    /// Replay this device's pending update files.
    ///
    /// # Errors
    /// - `Error::Authorization` in an administrator session
    /// - `Error::OutOfSequence` if the administrator must issue a recovery
    /// - `Error::RestartRequired` if replayed state could not be persisted
    pub fn process_updates(&self) -> Result<ReplayReport> {
        self.require(Role::User)?;
        let result = update::process_updates(&self.store, &self.config.update_dir, &self.config.retry);
        self.gate_cache.clear();
        if let Err(Error::RestartRequired(_)) = &result {
            self.poisoned.set(true);
        }
        let report = result?;
        self.sweep_expired()?;
        Ok(report)
    }

    /// Install the synchronization keys issued for this device.
    ///
    /// # Preconditions
    /// - The transfer key is present on this token
    ///
    /// # Errors
    /// - `Error::Parameter` if the provisioning targets another token
    pub fn provision_device(&self, provisioning: &DeviceProvisioning) -> Result<()> {
        self.require(Role::User)?;
        if provisioning.serial != self.token.serial_number() {
            return Err(Error::Parameter(format!(
                "Provisioning for {} presented to {}",
                provisioning.serial,
                self.token.serial_number()
            )));
        }
        let transfer = self.config.transfer_key_id;
        self.token
            .insert_wrapped_key(provisioning.k1, transfer, provisioning.wrapped_k1.as_bytes())?;
        self.token
            .insert_wrapped_key(provisioning.k2, transfer, provisioning.wrapped_k2.as_bytes())?;
        info!(user = %provisioning.user, "Device provisioned");
        Ok(())
    }

    /// Open an existing encrypted file, gated by the key's status.
    pub fn open_file(&self, path: &Path, mode: OpenMode) -> Result<EncryptedFile<'_, FileMedium>> {
        self.ensure_usable()?;
        SectorCodec::new(self.token(), SectorLayout::STANDARD).open_path(path, self.gate(), mode, None)
    }

    /// Create (or replace) an encrypted file under a managed key.
    ///
    /// The key is checked before the path is touched, so a refused key
    /// leaves an existing file intact.
    ///
    /// # Errors
    /// - `Error::NotFound` if the key is unknown
    /// - `Error::State` if the key may not encrypt
    pub fn create_file(&self, path: &Path, key: KeyId) -> Result<EncryptedFile<'_, FileMedium>> {
        self.ensure_usable()?;
        let name = logical_name(path)?;
        self.create_at(path, key, name)
    }

    fn create_at(&self, target: &Path, key: KeyId, name: &str) -> Result<EncryptedFile<'_, FileMedium>> {
        let row = self.store.get_key(key)?;
        let gate = self.gate();
        gate.check(key.value(), Direction::Encrypt)?;
        let new = NewFile {
            key_id: key.value(),
            algorithm: row.algorithm,
            name,
        };
        SectorCodec::new(self.token(), SectorLayout::STANDARD).create(FileMedium::create(target)?, gate, new)
    }

    /// Write `data` as the whole content of an encrypted file.
    ///
    /// The content is written beside the target and renamed over it, so the
    /// previous content survives any failure.
    pub fn write_file(&self, path: &Path, key: KeyId, data: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let name = logical_name(path)?;
        let staging = staging_path(path);
        let written = self.create_at(&staging, key, name).and_then(|mut file| {
            file.write(data)?;
            file.close()
        });
        match written {
            Ok(()) => {
                fs::rename(&staging, path)?;
                Ok(())
            }
            Err(e) => {
                if staging.exists() {
                    if let Err(cleanup) = fs::remove_file(&staging) {
                        warn!(path = %staging.display(), error = %cleanup, "Staging file left behind");
                    }
                }
                Err(e)
            }
        }
    }

    /// Read the whole content of an encrypted file.
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut file = self.open_file(path, OpenMode::Read)?;
        let data = file.read_all()?;
        file.close()?;
        Ok(data)
    }
}

fn logical_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Parameter(format!("Invalid file path {}", path.display())))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.poisoned.get() {
            warn!(session = self.handle.as_str(), "Poisoned session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::KeyStatus;
    use tempfile::TempDir;
    use tokenkms_crypto::SoftToken;

    const DB_KEY: u32 = 0xF000_0001;

    fn admin_token() -> Arc<SoftToken> {
        let token = SoftToken::new("SN-ADMIN", "1111", "2222");
        token.login("2222", LoginRole::Admin).unwrap();
        token.generate_key(DB_KEY, 32).unwrap();
        Arc::new(token)
    }

    fn open(temp: &TempDir, role: Role, token: Arc<SoftToken>) -> Result<Session> {
        let config = KmsConfig::new(temp.path().join("kms.db"), DB_KEY, temp.path(), role);
        Session::open(config, token)
    }

    #[test]
    fn test_role_must_match_login() {
        let temp = TempDir::new().unwrap();
        let token = SoftToken::new("SN-DEV", "1111", "2222");
        token.login("1111", LoginRole::User).unwrap();
        token.generate_key(DB_KEY, 32).unwrap();
        let token = Arc::new(token);

        assert!(matches!(
            open(&temp, Role::Admin, token.clone()),
            Err(Error::Authorization(_))
        ));
        let session = open(&temp, Role::User, token).unwrap();
        assert!(matches!(session.admin(), Err(Error::Authorization(_))));
    }

    #[test]
    fn test_admin_cannot_replay() {
        let temp = TempDir::new().unwrap();
        let session = open(&temp, Role::Admin, admin_token()).unwrap();
        assert!(matches!(session.process_updates(), Err(Error::Authorization(_))));
        assert!(!session.handle().as_str().is_empty());
    }

    #[test]
    fn test_file_roundtrip_through_gate() {
        let temp = TempDir::new().unwrap();
        let session = open(&temp, Role::Admin, admin_token()).unwrap();
        let admin = session.admin().unwrap();
        let group = admin.add_group("ops", Default::default()).unwrap().value;
        let key = admin.add_key(group.id, "file key", 0).unwrap().value;

        let path = temp.path().join("notes.txt");
        assert!(matches!(
            session.write_file(&path, key.id, b"draft"),
            Err(Error::State(_))
        ));

        admin.activate_key(key.id).unwrap();
        session.write_file(&path, key.id, b"hello sectors").unwrap();
        assert_eq!(session.read_file(&path).unwrap(), b"hello sectors");

        admin.change_status(key.id, KeyStatus::Suspended).unwrap();
        assert_eq!(session.read_file(&path).unwrap(), b"hello sectors");
        assert!(session.open_file(&path, OpenMode::ReadWrite).is_err());

        admin.change_status(key.id, KeyStatus::Compromised).unwrap();
        assert!(session.read_file(&path).is_err());
    }

    #[test]
    fn test_refused_key_keeps_existing_file() {
        let temp = TempDir::new().unwrap();
        let session = open(&temp, Role::Admin, admin_token()).unwrap();
        let admin = session.admin().unwrap();
        let group = admin.add_group("ops", Default::default()).unwrap().value;
        let key = admin.add_key(group.id, "file key", 0).unwrap().value;
        admin.activate_key(key.id).unwrap();

        let path = temp.path().join("ledger.txt");
        session.write_file(&path, key.id, b"precious data").unwrap();
        admin.change_status(key.id, KeyStatus::Suspended).unwrap();

        assert!(matches!(
            session.write_file(&path, key.id, b"new"),
            Err(Error::State(_))
        ));
        assert!(matches!(
            session.create_file(&path, key.id),
            Err(Error::State(_))
        ));
        assert_eq!(session.read_file(&path).unwrap(), b"precious data");
        assert!(!staging_path(&path).exists());
    }
}
