//! Key lifecycle store.
//!
//! The store is an in-memory SQLite database. After every committed
//! transaction its image is serialized and written through the database
//! sector layout to `<db>.journal`, which then replaces `<db>`. A journal left
//! behind by a crash is an incomplete image and is discarded at open.

use std::ffi::OsString;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, MAIN_DB};
use tracing::{debug, info, warn};

use tokenkms_codec::{AlwaysValid, FileMedium, NewFile, OpenMode, SectorCodec, SectorLayout};
use tokenkms_common::{is_kms_key_id, Error, GroupId, KeyId, Result, UserId};
use tokenkms_crypto::{Algorithm, CryptoToken};

use crate::config::KmsConfig;
use crate::model::{GroupRow, KeyRow, RecoveryEntry, UserRow};
use crate::retry::RetryPolicy;
use crate::schema;
use crate::sql_params;
use crate::status::{is_expiring, KeyStatus};
use crate::transaction::{bootstrap, Transaction};

/// Logical name recorded in the header of the database image.
const STORE_NAME: &str = "kms.db";

/// Where and how the database image is persisted.
struct Persistence {
    path: PathBuf,
    key_id: u32,
    algorithm: Algorithm,
}

/// Relational store of users, groups, memberships, keys and recovery
/// obligations.
pub struct KeyStore {
    conn: Connection,
    token: Arc<dyn CryptoToken>,
    persistence: Option<Persistence>,
}

impl KeyStore {
    /// Open the store configured in `config`, creating it if absent.
    ///
    /// # Preconditions
    /// - The database key is present on the token
    ///
    /// # Postconditions
    /// - The schema exists and passed the integrity check
    ///
    /// # Errors
    /// - `Error::Integrity` if the image fails verification
    /// - `Error::Storage` if the image cannot be loaded
    pub fn open(config: &KmsConfig, token: Arc<dyn CryptoToken>) -> Result<Self> {
        let persistence = Persistence {
            path: config.db_path.clone(),
            key_id: config.db_key_id,
            algorithm: config.db_algorithm,
        };

        let journal = journal_path(&persistence.path);
        if journal.exists() {
            warn!(path = %journal.display(), "Discarding incomplete store journal");
            fs::remove_file(&journal)?;
        }

        let mut conn = Connection::open_in_memory()?;
        let existing = persistence.path.exists();
        if existing {
            let codec = SectorCodec::new(token.as_ref(), SectorLayout::SQL);
            let mut file = codec.open_path(&persistence.path, AlwaysValid, OpenMode::Read, None)?;
            let image = file.read_all()?;
            file.close()?;
            let len = image.len();
            conn.deserialize_read_exact(MAIN_DB, Cursor::new(image), len, false)?;
            debug!(bytes = len, "Loaded store image");
        }

        bootstrap(&conn)?;
        schema::initialize(&conn)?;

        let store = Self {
            conn,
            token,
            persistence: Some(persistence),
        };
        if !existing {
            store.persist()?;
            info!("Created new key store");
        }
        Ok(store)
    }

    /// Open a store that is never written to disk.
    pub fn in_memory(token: Arc<dyn CryptoToken>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            token,
            persistence: None,
        })
    }

    /// Underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Token backing the store.
    pub fn token(&self) -> &dyn CryptoToken {
        self.token.as_ref()
    }

    /// Write the current image to disk.
    ///
    /// # Errors
    /// - Any failure leaves the previous image in place
    pub fn persist(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let image = self.conn.serialize(MAIN_DB)?;
        let journal = journal_path(&persistence.path);

        let codec = SectorCodec::new(self.token.as_ref(), SectorLayout::SQL);
        let new = NewFile {
            key_id: persistence.key_id,
            algorithm: persistence.algorithm,
            name: STORE_NAME,
        };
        let mut file = codec.create(FileMedium::create(&journal)?, AlwaysValid, new)?;
        file.write(&image)?;
        file.close()?;
        fs::rename(&journal, &persistence.path)?;

        debug!(bytes = image.len(), "Persisted store image");
        Ok(())
    }

    /// Find a user.
    pub fn find_user(&self, id: UserId) -> Result<Option<UserRow>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id.value()], UserRow::from_row)
            .optional()?)
    }

    /// Get a user.
    ///
    /// # Errors
    /// - `Error::NotFound` if the user does not exist
    pub fn get_user(&self, id: UserId) -> Result<UserRow> {
        self.find_user(id)?
            .ok_or_else(|| Error::NotFound(format!("User {} not found", id)))
    }

    /// Find the user owning a token serial number.
    pub fn user_by_serial(&self, serial: &str) -> Result<Option<UserRow>> {
        let sql = format!("SELECT {} FROM users WHERE serial = ?1", UserRow::COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [serial], UserRow::from_row)
            .optional()?)
    }

    /// All users ordered by id.
    pub fn users(&self) -> Result<Vec<UserRow>> {
        let sql = format!("SELECT {} FROM users ORDER BY id", UserRow::COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], UserRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Find a group.
    pub fn find_group(&self, id: GroupId) -> Result<Option<GroupRow>> {
        let sql = format!("{} WHERE g.id = ?1", GroupRow::SELECT);
        Ok(self
            .conn
            .query_row(&sql, [id.value()], GroupRow::from_row)
            .optional()?)
    }

    /// Get a group.
    ///
    /// # Errors
    /// - `Error::NotFound` if the group does not exist
    pub fn get_group(&self, id: GroupId) -> Result<GroupRow> {
        self.find_group(id)?
            .ok_or_else(|| Error::NotFound(format!("Group {} not found", id)))
    }

    /// All groups ordered by id.
    pub fn groups(&self) -> Result<Vec<GroupRow>> {
        let sql = format!("{} ORDER BY g.id", GroupRow::SELECT);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], GroupRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Members of a group ordered by id.
    pub fn group_members(&self, group: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM user_groups WHERE group_id = ?1 ORDER BY user_id")?;
        let ids = stmt.query_map([group.value()], |row| row.get::<_, u32>(0))?;
        ids.map(|id| UserId::new(id?)).collect()
    }

    /// Groups a user belongs to, ordered by id.
    pub fn user_groups(&self, user: UserId) -> Result<Vec<GroupId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id FROM user_groups WHERE user_id = ?1 ORDER BY group_id")?;
        let ids = stmt.query_map([user.value()], |row| row.get::<_, u32>(0))?;
        ids.map(|id| GroupId::new(id?)).collect()
    }

    /// Whether `user` is a member of `group`.
    pub fn is_member(&self, user: UserId, group: GroupId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM user_groups WHERE user_id = ?1 AND group_id = ?2",
                params![user.value(), group.value()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Users sharing at least one group with `user`, excluding `user`.
    pub fn co_members(&self, user: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT b.user_id FROM user_groups a
             JOIN user_groups b ON a.group_id = b.group_id
             WHERE a.user_id = ?1 AND b.user_id != ?1
             ORDER BY b.user_id",
        )?;
        let ids = stmt.query_map([user.value()], |row| row.get::<_, u32>(0))?;
        ids.map(|id| UserId::new(id?)).collect()
    }

    /// Find a key.
    pub fn find_key(&self, id: KeyId) -> Result<Option<KeyRow>> {
        let sql = format!("SELECT {} FROM keys WHERE id = ?1", KeyRow::COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id.value()], KeyRow::from_row)
            .optional()?)
    }

    /// Get a key.
    ///
    /// # Errors
    /// - `Error::NotFound` if the key does not exist
    pub fn get_key(&self, id: KeyId) -> Result<KeyRow> {
        self.find_key(id)?
            .ok_or_else(|| Error::NotFound(format!("Key {} not found", id)))
    }

    /// All keys ordered by id.
    pub fn keys(&self) -> Result<Vec<KeyRow>> {
        let sql = format!("SELECT {} FROM keys ORDER BY id", KeyRow::COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], KeyRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Keys owned by a group, ordered by id.
    pub fn group_keys(&self, group: GroupId) -> Result<Vec<KeyRow>> {
        let sql = format!(
            "SELECT {} FROM keys WHERE owner_group = ?1 ORDER BY id",
            KeyRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([group.value()], KeyRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Pending recovery obligations.
    pub fn recovery_entries(&self) -> Result<Vec<RecoveryEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, serial FROM recovery ORDER BY user_id")?;
        let rows = stmt.query_map([], RecoveryEntry::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Counter of the last update applied on this device.
    pub fn device_counter(&self) -> Result<u64> {
        let counter: i64 = self
            .conn
            .query_row("SELECT update_counter FROM device_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        Ok(counter as u64)
    }

    /// Record the applied update counter inside `tx`.
    pub(crate) fn set_device_counter(tx: &Transaction<'_>, counter: u64) -> Result<()> {
        tx.execute_local(
            "UPDATE device_state SET update_counter = ?1 WHERE id = 1",
            sql_params![counter],
        )?;
        Ok(())
    }

    /// Reserve the next id of a sequence inside `tx`.
    pub(crate) fn allocate_id(tx: &Transaction<'_>, sequence: &str) -> Result<u32> {
        let name = format!("next_{}_id", sequence);
        let next: i64 = tx
            .conn()
            .query_row("SELECT value FROM meta WHERE name = ?1", [&name], |row| row.get(0))
            .optional()?
            .unwrap_or(1);
        tx.execute_local(
            "INSERT OR REPLACE INTO meta (name, value) VALUES (?1, ?2)",
            sql_params![name.as_str(), next + 1],
        )?;
        u32::try_from(next).map_err(|_| Error::State(format!("{} ids exhausted", sequence)))
    }

    /// Delete KMS-range key material from the token that no live key row
    /// accounts for. Returns the number of keys removed.
    pub fn reconcile_token(&self) -> Result<usize> {
        let mut removed = 0;
        for info in self.token.list_keys()? {
            if !is_kms_key_id(info.id) {
                continue;
            }
            let live = match self.find_key(KeyId::new(info.id)?)? {
                Some(row) => row.status != KeyStatus::Destroyed,
                None => false,
            };
            if !live {
                self.token.delete_key(info.id)?;
                removed += 1;
                debug!(key_id = info.id, "Removed orphaned key material");
            }
        }
        Ok(removed)
    }

    /// Force every active or suspended key inside the expiry margin to
    /// deactivated. Runs in its own local transaction and returns the keys
    /// that changed.
    pub fn sweep_expired(&self, policy: &RetryPolicy, now: i64) -> Result<Vec<KeyId>> {
        let expiring: Vec<KeyId> = self
            .keys()?
            .into_iter()
            .filter(|k| matches!(k.status, KeyStatus::Active | KeyStatus::Suspended))
            .filter(|k| is_expiring(k.expires_at, now))
            .map(|k| k.id)
            .collect();
        if expiring.is_empty() {
            return Ok(expiring);
        }

        let tx = Transaction::begin(&self.conn, policy)?;
        for id in &expiring {
            tx.execute_local(
                "UPDATE keys SET status = ?1, deactivated_at = ?2 WHERE id = ?3",
                sql_params![KeyStatus::Deactivated.code(), now, id.value()],
            )?;
        }
        tx.commit()?;
        info!(count = expiring.len(), "Expired keys deactivated");
        Ok(expiring)
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".journal");
    PathBuf::from(name)
}
