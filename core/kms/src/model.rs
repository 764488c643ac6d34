//! Rows of the key store.

use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use tokenkms_common::{GroupId, KeyId, UserId};
use tokenkms_crypto::Algorithm;

use crate::sql_params;
use crate::status::KeyStatus;
use crate::transaction::CapturedStatement;

fn conversion<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(err))
}

fn user_id(row: &Row<'_>, index: usize) -> rusqlite::Result<UserId> {
    UserId::new(row.get(index)?).map_err(|e| conversion(index, e))
}

fn group_id(row: &Row<'_>, index: usize) -> rusqlite::Result<GroupId> {
    GroupId::new(row.get(index)?).map_err(|e| conversion(index, e))
}

fn key_id(row: &Row<'_>, index: usize) -> rusqlite::Result<KeyId> {
    KeyId::new(row.get(index)?).map_err(|e| conversion(index, e))
}

fn algorithm(row: &Row<'_>, index: usize) -> rusqlite::Result<Algorithm> {
    Algorithm::from_id(row.get(index)?).map_err(|e| conversion(index, e))
}

/// A KMS user and its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    /// User id.
    pub id: UserId,
    /// Unique user name.
    pub name: String,
    /// Serial number of the user's token.
    pub serial: String,
    /// Opaque device PIN, passed through to the device.
    pub pin: String,
    /// Opaque device administrator PIN.
    pub admin_pin: String,
    /// Last update counter issued to (admin) or applied by (device) the user.
    pub update_counter: u64,
    /// Transport key id.
    pub k1: u32,
    /// Wrapping key id.
    pub k2: u32,
    /// Whether the init file has been delivered.
    pub initialized: bool,
}

impl UserRow {
    pub(crate) const COLUMNS: &'static str =
        "id, name, serial, pin, admin_pin, update_counter, k1, k2, initialized";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: user_id(row, 0)?,
            name: row.get(1)?,
            serial: row.get(2)?,
            pin: row.get(3)?,
            admin_pin: row.get(4)?,
            update_counter: row.get::<_, i64>(5)? as u64,
            k1: row.get(6)?,
            k2: row.get(7)?,
            initialized: row.get::<_, i64>(8)? != 0,
        })
    }

    /// Copy without device secrets or admin bookkeeping, as shared with
    /// co-members.
    pub fn sanitized(&self) -> Self {
        Self {
            pin: String::new(),
            admin_pin: String::new(),
            update_counter: 0,
            initialized: false,
            ..self.clone()
        }
    }

    /// Statement recreating this row on another store.
    pub fn upsert_statement(&self) -> CapturedStatement {
        CapturedStatement::new(
            format!(
                "INSERT OR REPLACE INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                Self::COLUMNS
            ),
            sql_params![
                self.id.value(),
                self.name.as_str(),
                self.serial.as_str(),
                self.pin.as_str(),
                self.admin_pin.as_str(),
                self.update_counter,
                self.k1,
                self.k2,
                self.initialized,
            ],
        )
    }
}

/// Key policy of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Maximum number of non-destroyed keys the group may own.
    pub max_keys: u32,
    /// Algorithm of every key of the group.
    pub algorithm: Algorithm,
    /// Default cryptoperiod in seconds.
    pub cryptoperiod: i64,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            max_keys: 16,
            algorithm: Algorithm::Aes256,
            cryptoperiod: 365 * 24 * 3600,
        }
    }
}

/// A group of users sharing keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRow {
    /// Group id.
    pub id: GroupId,
    /// Unique group name.
    pub name: String,
    /// Key policy.
    pub policy: GroupPolicy,
    /// Number of members.
    pub user_count: u32,
    /// Number of non-destroyed keys owned.
    pub key_count: u32,
}

impl GroupRow {
    pub(crate) const SELECT: &'static str = "SELECT g.id, g.name, g.max_keys, g.algorithm, g.cryptoperiod,
            (SELECT COUNT(*) FROM user_groups ug WHERE ug.group_id = g.id),
            (SELECT COUNT(*) FROM keys k WHERE k.owner_group = g.id AND k.status != 5)
         FROM key_groups g";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: group_id(row, 0)?,
            name: row.get(1)?,
            policy: GroupPolicy {
                max_keys: row.get(2)?,
                algorithm: algorithm(row, 3)?,
                cryptoperiod: row.get(4)?,
            },
            user_count: row.get(5)?,
            key_count: row.get(6)?,
        })
    }

    /// Statement recreating this row on another store.
    pub fn upsert_statement(&self) -> CapturedStatement {
        CapturedStatement::new(
            "INSERT OR REPLACE INTO key_groups (id, name, max_keys, algorithm, cryptoperiod)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            sql_params![
                self.id.value(),
                self.name.as_str(),
                self.policy.max_keys,
                self.policy.algorithm.id() as i64,
                self.policy.cryptoperiod,
            ],
        )
    }
}

/// A managed symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRow {
    /// Key id, equal to the token key id.
    pub id: KeyId,
    /// Display name.
    pub name: String,
    /// Owning group; `None` for zombie keys.
    pub owner: Option<GroupId>,
    /// Lifecycle status.
    pub status: KeyStatus,
    /// Algorithm.
    pub algorithm: Algorithm,
    /// Key length in bytes.
    pub length: u32,
    /// Unix timestamps, 0 when unset.
    pub generated_at: i64,
    pub activated_at: i64,
    pub expires_at: i64,
    pub deactivated_at: i64,
    pub compromised_at: i64,
    pub destroyed_at: i64,
    pub suspended_at: i64,
    /// Own cryptoperiod in seconds; 0 inherits the group default.
    pub cryptoperiod: i64,
}

impl KeyRow {
    pub(crate) const COLUMNS: &'static str = "id, name, owner_group, status, algorithm, length, \
         generated_at, activated_at, expires_at, deactivated_at, compromised_at, destroyed_at, \
         suspended_at, cryptoperiod";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let owner: Option<u32> = row.get(2)?;
        Ok(Self {
            id: key_id(row, 0)?,
            name: row.get(1)?,
            owner: owner
                .map(GroupId::new)
                .transpose()
                .map_err(|e| conversion(2, e))?,
            status: KeyStatus::from_code(row.get(3)?).map_err(|e| conversion(3, e))?,
            algorithm: algorithm(row, 4)?,
            length: row.get(5)?,
            generated_at: row.get(6)?,
            activated_at: row.get(7)?,
            expires_at: row.get(8)?,
            deactivated_at: row.get(9)?,
            compromised_at: row.get(10)?,
            destroyed_at: row.get(11)?,
            suspended_at: row.get(12)?,
            cryptoperiod: row.get(13)?,
        })
    }

    /// Whether the owning group was deleted.
    pub fn is_zombie(&self) -> bool {
        self.owner.is_none()
    }

    /// Length of the validity window, `expires_at - activated_at`.
    pub fn validity_window(&self) -> i64 {
        self.expires_at - self.activated_at
    }

    /// Statement recreating this row on another store.
    pub fn upsert_statement(&self) -> CapturedStatement {
        CapturedStatement::new(
            format!(
                "INSERT OR REPLACE INTO keys ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                Self::COLUMNS
            ),
            sql_params![
                self.id.value(),
                self.name.as_str(),
                self.owner.map(|g| g.value()),
                self.status.code(),
                self.algorithm.id() as i64,
                self.length,
                self.generated_at,
                self.activated_at,
                self.expires_at,
                self.deactivated_at,
                self.compromised_at,
                self.destroyed_at,
                self.suspended_at,
                self.cryptoperiod,
            ],
        )
    }
}

/// Membership statement for another store.
pub fn membership_statement(user: UserId, group: GroupId) -> CapturedStatement {
    CapturedStatement::new(
        "INSERT OR IGNORE INTO user_groups (user_id, group_id) VALUES (?1, ?2)",
        sql_params![user.value(), group.value()],
    )
}

/// A user awaiting a full resynchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    /// User id.
    pub user: UserId,
    /// Serial number of the user's token.
    pub serial: String,
}

impl RecoveryEntry {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user: user_id(row, 0)?,
            serial: row.get(1)?,
        })
    }
}
