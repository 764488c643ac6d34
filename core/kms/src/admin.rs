//! Administrator mutations and update distribution.
//!
//! Every mutation runs the expiry sweep, refuses to start while a user it
//! does not touch has a pending recovery obligation, and commits as one
//! transaction that also records a recovery obligation for each user it
//! affects. Distribution happens after
//! the commit and is best effort: a user whose update file was durably
//! written loses its obligation, any other user keeps it until
//! [`AdminOps::process_recovery`] succeeds.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tokenkms_common::{now_ts, Error, GroupId, KeyId, Result, SensitiveBytes, UserId};

use crate::model::{membership_statement, GroupPolicy, GroupRow, KeyRow, UserRow};
use crate::session::Session;
use crate::sql_params;
use crate::status::{activation_window, KeyStatus};
use crate::store::KeyStore;
use crate::transaction::{CapturedStatement, Transaction};
use crate::update::replay::{drop_membership, drop_user, orphan_group};
use crate::update::{
    full_state_records, numbered, update_path, write_update_file, RecordBody, UpdateFileKind,
    SYNC_ALGORITHM,
};

/// Highest user id whose synchronization key ids still fit in 32 bits.
const MAX_USER_ID: u32 = 0x3FFF_FFFE;

/// Users reached and missed by a distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    /// Users whose update file was written.
    pub delivered: Vec<UserId>,
    /// Users left with a pending recovery obligation.
    pub failed: Vec<UserId>,
}

impl DistributionReport {
    /// Whether every affected user was reached.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    /// Value produced by the mutation.
    pub value: T,
    /// What happened to the resulting updates.
    pub report: DistributionReport,
}

/// Synchronization keys of a new user, wrapped with the transfer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProvisioning {
    /// New user.
    pub user: UserId,
    /// Serial number of the user's token.
    pub serial: String,
    /// Transport key id.
    pub k1: u32,
    /// Wrapping key id.
    pub k2: u32,
    /// Transport key wrapped with the transfer key.
    pub wrapped_k1: SensitiveBytes,
    /// Wrapping key wrapped with the transfer key.
    pub wrapped_k2: SensitiveBytes,
}

/// What a user receives after a mutation.
enum Delivery {
    /// Incremental records: the captured statements followed by `extra`.
    Records { captured: bool, extra: Vec<RecordBody> },
    /// A complete init or recovery file.
    FullState,
}

struct Planned {
    user: UserRow,
    delivery: Delivery,
    /// Whether a recovery obligation is recorded for the user.
    tracked: bool,
}

impl Planned {
    fn captured(user: UserRow) -> Self {
        Self::records(user, true, Vec::new())
    }

    fn records(user: UserRow, captured: bool, extra: Vec<RecordBody>) -> Self {
        Self {
            user,
            delivery: Delivery::Records { captured, extra },
            tracked: true,
        }
    }

    fn full_state(user: UserRow) -> Self {
        Self {
            user,
            delivery: Delivery::FullState,
            tracked: true,
        }
    }
}

type Staged<T> = (T, Vec<Planned>);

fn ids(users: &[UserRow]) -> Vec<UserId> {
    users.iter().map(|u| u.id).collect()
}

fn planned_ids(plan: &[Planned]) -> Vec<UserId> {
    plan.iter().map(|p| p.user.id).collect()
}

fn require_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Parameter(format!("{} name cannot be empty", what)));
    }
    Ok(())
}

fn validate_policy(policy: &GroupPolicy) -> Result<()> {
    if policy.max_keys == 0 {
        return Err(Error::Parameter("A group must allow at least one key".to_string()));
    }
    if policy.cryptoperiod <= 0 {
        return Err(Error::Parameter(format!(
            "Invalid default cryptoperiod {}",
            policy.cryptoperiod
        )));
    }
    Ok(())
}

fn execute_statement(tx: &mut Transaction<'_>, statement: CapturedStatement) -> Result<usize> {
    tx.execute(&statement.sql, statement.params)
}

/// Administrator operations on a session.
pub struct AdminOps<'s> {
    session: &'s Session,
}

impl<'s> AdminOps<'s> {
    pub(crate) fn new(session: &'s Session) -> Self {
        Self { session }
    }

    fn store(&self) -> &'s KeyStore {
        self.session.store()
    }

    fn users(&self, ids: &[UserId]) -> Result<Vec<UserRow>> {
        ids.iter().map(|id| self.store().get_user(*id)).collect()
    }

    fn members_captured(&self, group: GroupId) -> Result<Vec<Planned>> {
        Ok(self
            .users(&self.store().group_members(group)?)?
            .into_iter()
            .map(Planned::captured)
            .collect())
    }

    fn key_audience(&self, key: &KeyRow) -> Result<Vec<Planned>> {
        match key.owner {
            Some(group) => self.members_captured(group),
            None => Ok(Vec::new()),
        }
    }

    /// Refuse while a user outside `affected` awaits recovery. Returns the
    /// affected users that await recovery themselves.
    fn ensure_unblocked(&self, affected: &[UserId]) -> Result<Vec<UserId>> {
        let (pending, blocking): (Vec<UserId>, Vec<UserId>) = self
            .store()
            .recovery_entries()?
            .into_iter()
            .map(|e| e.user)
            .partition(|user| affected.contains(user));
        if !blocking.is_empty() {
            let users: Vec<String> = blocking.iter().map(UserId::to_string).collect();
            return Err(Error::Blocked(format!(
                "Recovery pending for {}",
                users.join(", ")
            )));
        }
        Ok(pending)
    }

    /// Run one mutation transaction and distribute its updates.
    ///
    /// `affected` lists the existing users the mutation touches. Their own
    /// pending recovery does not block it; they receive the full state
    /// instead of incremental records.
    fn mutate<T>(
        &self,
        what: &str,
        affected: &[UserId],
        build: impl FnOnce(&mut Transaction<'_>) -> Result<Staged<T>>,
    ) -> Result<Outcome<T>> {
        self.session.sweep_expired()?;
        let pending = self.ensure_unblocked(affected)?;

        let retry = &self.session.config().retry;
        let mut tx = Transaction::begin(self.store().conn(), retry)?;
        let staged = build(&mut tx);
        let staged = staged.and_then(|staged| {
            for planned in staged.1.iter().filter(|p| p.tracked) {
                tx.execute_local(
                    "INSERT OR REPLACE INTO recovery (user_id, serial) VALUES (?1, ?2)",
                    sql_params![planned.user.id.value(), planned.user.serial.as_str()],
                )?;
            }
            Ok(staged)
        });
        let (value, mut plan) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                tx.rollback()?;
                return Err(err);
            }
        };

        for planned in plan.iter_mut() {
            if planned.tracked && pending.contains(&planned.user.id) {
                planned.delivery = Delivery::FullState;
            }
        }

        let captured = tx.commit()?;
        self.session.after_commit()?;
        info!(what, statements = captured.len(), recipients = plan.len(), "Mutation committed");

        let report = self.distribute(&captured, plan);
        Ok(Outcome { value, report })
    }

    fn distribute(&self, captured: &[CapturedStatement], plan: Vec<Planned>) -> DistributionReport {
        let mut report = DistributionReport::default();
        for planned in plan {
            let user = planned.user.id;
            match self.deliver(captured, planned) {
                Ok(()) => report.delivered.push(user),
                Err(e) => {
                    warn!(%user, error = %e, "Update delivery failed, recovery pending");
                    report.failed.push(user);
                }
            }
        }
        report
    }

    fn deliver(&self, captured: &[CapturedStatement], planned: Planned) -> Result<()> {
        let store = self.store();
        let dir = &self.session.config().update_dir;

        match planned.delivery {
            Delivery::Records { captured: with_captured, extra } => {
                let base = store
                    .find_user(planned.user.id)?
                    .map_or(planned.user.update_counter, |u| u.update_counter);
                let mut bodies: Vec<RecordBody> = if with_captured {
                    captured.iter().cloned().map(RecordBody::Statement).collect()
                } else {
                    Vec::new()
                };
                bodies.extend(extra);
                let records = numbered(base, bodies);
                if !records.is_empty() {
                    write_update_file(store.token(), dir, &planned.user, UpdateFileKind::Normal, &records)?;
                }
                self.settle(planned.user.id, base + records.len() as u64, None)
            }
            Delivery::FullState => {
                let user = store.get_user(planned.user.id)?;
                let kind = if user.initialized {
                    UpdateFileKind::Recovery
                } else {
                    UpdateFileKind::Init
                };
                let records = full_state_records(store, &user)?;
                write_update_file(store.token(), dir, &user, kind, &records)?;
                let normal = update_path(dir, &user.serial, UpdateFileKind::Normal);
                if normal.exists() {
                    fs::remove_file(&normal)?;
                }
                self.settle(user.id, records.len() as u64 - 1, Some(kind))
            }
        }
    }

    /// Record the issued counter and clear the user's recovery obligation.
    fn settle(&self, user: UserId, counter: u64, full_state: Option<UpdateFileKind>) -> Result<()> {
        let tx = Transaction::begin(self.store().conn(), &self.session.config().retry)?;
        tx.execute_local(
            "UPDATE users SET update_counter = ?1 WHERE id = ?2",
            sql_params![counter, user.value()],
        )?;
        if full_state.is_some() {
            tx.execute_local(
                "UPDATE users SET initialized = 1 WHERE id = ?1",
                sql_params![user.value()],
            )?;
        }
        tx.execute_local("DELETE FROM recovery WHERE user_id = ?1", sql_params![user.value()])?;
        tx.commit()?;
        self.session.after_commit()?;
        debug!(%user, counter, kind = ?full_state, "Update delivered");
        Ok(())
    }

    /// Write full-state files for every user with a pending recovery
    /// obligation. Users that were initialized receive a recovery file, the
    /// others their init file.
    pub fn process_recovery(&self) -> Result<DistributionReport> {
        self.session.ensure_usable()?;
        let mut plan = Vec::new();
        for entry in self.store().recovery_entries()? {
            match self.store().find_user(entry.user)? {
                Some(user) => plan.push(Planned::full_state(user)),
                None => {
                    warn!(user = %entry.user, "Dropping recovery obligation of deleted user");
                    self.settle(entry.user, 0, None)?;
                }
            }
        }
        Ok(self.distribute(&[], plan))
    }

    /// Add a user and issue its synchronization keys.
    ///
    /// # Postconditions
    /// - k1 and k2 exist on the administrator token
    /// - The user's init file is written (or a recovery obligation remains)
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the name or serial number is taken
    pub fn add_user(
        &self,
        name: &str,
        serial: &str,
        pin: &str,
        admin_pin: &str,
    ) -> Result<Outcome<(UserRow, DeviceProvisioning)>> {
        require_name("User", name)?;
        require_name("Serial", serial)?;
        if self.store().users()?.iter().any(|u| u.name == name || u.serial == serial) {
            return Err(Error::AlreadyExists(format!(
                "A user named {} or with serial {} exists",
                name, serial
            )));
        }
        let token = self.store().token();
        let transfer = self.session.config().transfer_key_id;

        self.mutate("add_user", &[], |tx| {
            let id = KeyStore::allocate_id(tx, "user")?;
            if id > MAX_USER_ID {
                return Err(Error::State("User ids exhausted".to_string()));
            }
            let id = UserId::new(id)?;
            let user = UserRow {
                id,
                name: name.to_string(),
                serial: serial.to_string(),
                pin: pin.to_string(),
                admin_pin: admin_pin.to_string(),
                update_counter: 0,
                k1: id.transport_key_id(),
                k2: id.wrapping_key_id(),
                initialized: false,
            };
            execute_statement(tx, user.upsert_statement())?;

            token.generate_key(user.k1, SYNC_ALGORITHM.key_len())?;
            token.generate_key(user.k2, SYNC_ALGORITHM.key_len())?;
            let provisioning = DeviceProvisioning {
                user: id,
                serial: user.serial.clone(),
                k1: user.k1,
                k2: user.k2,
                wrapped_k1: SensitiveBytes::new(token.export_wrapped_key(user.k1, transfer)?),
                wrapped_k2: SensitiveBytes::new(token.export_wrapped_key(user.k2, transfer)?),
            };
            info!(user = %id, "User added");
            Ok(((user.clone(), provisioning), vec![Planned::full_state(user)]))
        })
    }

    /// Delete a user, its memberships and its synchronization keys.
    pub fn delete_user(&self, user: UserId) -> Result<Outcome<()>> {
        let row = self.store().get_user(user)?;
        let co_members = self.users(&self.store().co_members(user)?)?;
        let mut affected = vec![user];
        affected.extend(ids(&co_members));

        let outcome = self.mutate("delete_user", &affected, |tx| {
            drop_user(tx, user)?;
            tx.execute_local("DELETE FROM recovery WHERE user_id = ?1", sql_params![user.value()])?;
            let removal = || vec![RecordBody::RemoveUser(user)];
            let mut plan = vec![Planned {
                tracked: false,
                ..Planned::records(row.clone(), false, removal())
            }];
            plan.extend(co_members.into_iter().map(|u| Planned::records(u, false, removal())));
            Ok(((), plan))
        })?;

        let token = self.store().token();
        for key_id in [row.k1, row.k2] {
            if let Err(e) = token.delete_key(key_id) {
                warn!(%user, key_id, error = %e, "Synchronization key not removed");
            }
        }
        info!(%user, "User deleted");
        Ok(outcome)
    }

    /// Rename a user.
    pub fn rename_user(&self, user: UserId, name: &str) -> Result<Outcome<()>> {
        require_name("User", name)?;
        let mut audience = vec![user];
        audience.extend(self.store().co_members(user)?);
        let audience = self.users(&audience)?;

        self.mutate("rename_user", &ids(&audience), |tx| {
            tx.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                sql_params![name, user.value()],
            )?;
            Ok(((), audience.into_iter().map(Planned::captured).collect()))
        })
    }

    /// Add an empty group.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the name is taken
    /// - `Error::Parameter` for an invalid policy
    pub fn add_group(&self, name: &str, policy: GroupPolicy) -> Result<Outcome<GroupRow>> {
        require_name("Group", name)?;
        validate_policy(&policy)?;
        if self.store().groups()?.iter().any(|g| g.name == name) {
            return Err(Error::AlreadyExists(format!("Group {} exists", name)));
        }

        self.mutate("add_group", &[], |tx| {
            let id = GroupId::new(KeyStore::allocate_id(tx, "group")?)?;
            let group = GroupRow {
                id,
                name: name.to_string(),
                policy,
                user_count: 0,
                key_count: 0,
            };
            execute_statement(tx, group.upsert_statement())?;
            info!(group = %id, "Group added");
            Ok((group, Vec::new()))
        })
    }

    /// Delete a group. Its keys become deactivated zombies and every former
    /// member is told to drop the group.
    pub fn delete_group(&self, group: GroupId) -> Result<Outcome<()>> {
        self.store().get_group(group)?;
        let members = self.users(&self.store().group_members(group)?)?;
        let deactivated_at = now_ts();

        self.mutate("delete_group", &ids(&members), |tx| {
            orphan_group(tx, group, deactivated_at)?;
            let plan = members
                .into_iter()
                .map(|u| {
                    Planned::records(u, false, vec![RecordBody::RemoveGroup { group, deactivated_at }])
                })
                .collect();
            info!(%group, "Group deleted");
            Ok(((), plan))
        })
    }

    /// Rename a group.
    pub fn rename_group(&self, group: GroupId, name: &str) -> Result<Outcome<()>> {
        require_name("Group", name)?;
        self.store().get_group(group)?;
        let plan = self.members_captured(group)?;

        self.mutate("rename_group", &planned_ids(&plan), |tx| {
            tx.execute(
                "UPDATE key_groups SET name = ?1 WHERE id = ?2",
                sql_params![name, group.value()],
            )?;
            Ok(((), plan))
        })
    }

    /// Replace a group's key policy. Existing keys are not touched.
    pub fn set_policy(&self, group: GroupId, policy: GroupPolicy) -> Result<Outcome<()>> {
        validate_policy(&policy)?;
        self.store().get_group(group)?;
        let plan = self.members_captured(group)?;

        self.mutate("set_policy", &planned_ids(&plan), |tx| {
            tx.execute(
                "UPDATE key_groups SET max_keys = ?1, algorithm = ?2, cryptoperiod = ?3 WHERE id = ?4",
                sql_params![
                    policy.max_keys,
                    policy.algorithm.id() as i64,
                    policy.cryptoperiod,
                    group.value(),
                ],
            )?;
            Ok(((), plan))
        })
    }

    /// Add `user` to `group`. The user receives the full state including the
    /// group's keys; the other members learn about the new member.
    pub fn add_member(&self, user: UserId, group: GroupId) -> Result<Outcome<()>> {
        let joiner = self.store().get_user(user)?;
        self.store().get_group(group)?;
        if self.store().is_member(user, group)? {
            return Err(Error::AlreadyExists(format!("{} is already in {}", user, group)));
        }
        let others = self.users(&self.store().group_members(group)?)?;
        let mut affected = vec![user];
        affected.extend(ids(&others));

        self.mutate("add_member", &affected, |tx| {
            execute_statement(tx, membership_statement(user, group))?;
            let introduction = RecordBody::Statement(joiner.sanitized().upsert_statement());
            let mut plan = vec![Planned::full_state(joiner.clone())];
            plan.extend(
                others
                    .into_iter()
                    .map(|u| Planned::records(u, true, vec![introduction.clone()])),
            );
            info!(%user, %group, "Member added");
            Ok(((), plan))
        })
    }

    /// Remove `user` from `group`.
    ///
    /// # Errors
    /// - `Error::NotFound` if the user is not a member
    pub fn remove_member(&self, user: UserId, group: GroupId) -> Result<Outcome<()>> {
        if !self.store().is_member(user, group)? {
            return Err(Error::NotFound(format!("{} is not in {}", user, group)));
        }
        let members = self.users(&self.store().group_members(group)?)?;

        self.mutate("remove_member", &ids(&members), |tx| {
            drop_membership(tx, user, group)?;
            let plan = members
                .into_iter()
                .map(|u| {
                    Planned::records(u, false, vec![RecordBody::RemoveUserFromGroup { user, group }])
                })
                .collect();
            info!(%user, %group, "Member removed");
            Ok(((), plan))
        })
    }

    /// Generate a new preactive key for `group`.
    ///
    /// `cryptoperiod` of 0 inherits the group default. The key uses the
    /// group's algorithm and is delivered to every member.
    ///
    /// # Errors
    /// - `Error::State` if the group reached its key limit
    pub fn add_key(&self, group: GroupId, name: &str, cryptoperiod: i64) -> Result<Outcome<KeyRow>> {
        require_name("Key", name)?;
        if cryptoperiod < 0 {
            return Err(Error::Parameter(format!("Invalid cryptoperiod {}", cryptoperiod)));
        }
        let owner = self.store().get_group(group)?;
        if owner.key_count >= owner.policy.max_keys {
            return Err(Error::State(format!(
                "Group {} already holds {} of {} keys",
                group, owner.key_count, owner.policy.max_keys
            )));
        }
        let members = self.users(&self.store().group_members(group)?)?;
        let token = self.store().token();

        self.mutate("add_key", &ids(&members), |tx| {
            let id = KeyId::managed(KeyStore::allocate_id(tx, "key")?)?;
            let algorithm = owner.policy.algorithm;
            token.generate_key(id.value(), algorithm.key_len())?;
            let key = KeyRow {
                id,
                name: name.to_string(),
                owner: Some(group),
                status: KeyStatus::PreActive,
                algorithm,
                length: algorithm.key_len() as u32,
                generated_at: now_ts(),
                activated_at: 0,
                expires_at: 0,
                deactivated_at: 0,
                compromised_at: 0,
                destroyed_at: 0,
                suspended_at: 0,
                cryptoperiod,
            };
            execute_statement(tx, key.upsert_statement())?;

            let mut plan = Vec::with_capacity(members.len());
            for member in members {
                let wrapped = token.export_wrapped_key(id.value(), member.k2)?;
                plan.push(Planned::records(
                    member,
                    true,
                    vec![RecordBody::DeliverKey { key_id: id, wrapped }],
                ));
            }
            info!(key = %id, %group, "Key generated");
            Ok((key, plan))
        })
    }

    /// Activate a key.
    ///
    /// The first activation stamps the activation time and the expiration
    /// derived from the cryptoperiod; reactivating a suspended key keeps them.
    ///
    /// # Errors
    /// - `Error::State` for an illegal transition, including an already
    ///   active key, or a key without a group
    pub fn activate_key(&self, key: KeyId) -> Result<Outcome<KeyRow>> {
        let row = self.store().get_key(key)?;
        row.status.transition(KeyStatus::Active)?;
        let group = row
            .owner
            .ok_or_else(|| Error::State(format!("Key {} has no group", key)))?;
        let group_period = self.store().get_group(group)?.policy.cryptoperiod;
        let (activated_at, expires_at) = activation_window(
            row.activated_at,
            row.expires_at,
            row.cryptoperiod,
            group_period,
            now_ts(),
        );
        let plan = self.key_audience(&row)?;

        self.mutate("activate_key", &planned_ids(&plan), |tx| {
            tx.execute(
                "UPDATE keys SET status = ?1, activated_at = ?2, expires_at = ?3 WHERE id = ?4",
                sql_params![KeyStatus::Active.code(), activated_at, expires_at, key.value()],
            )?;
            info!(%key, expires_at, "Key activated");
            Ok((self.store().get_key(key)?, plan))
        })
    }

    /// Move a key to another status, stamping the matching timestamp.
    pub fn change_status(&self, key: KeyId, status: KeyStatus) -> Result<Outcome<KeyRow>> {
        if status == KeyStatus::Active {
            return self.activate_key(key);
        }
        let row = self.store().get_key(key)?;
        row.status.transition(status)?;
        let plan = self.key_audience(&row)?;
        let now = now_ts();

        self.mutate("change_status", &planned_ids(&plan), |tx| {
            match status.timestamp_column() {
                Some(column) => tx.execute(
                    &format!("UPDATE keys SET status = ?1, {} = ?2 WHERE id = ?3", column),
                    sql_params![status.code(), now, key.value()],
                )?,
                None => tx.execute(
                    "UPDATE keys SET status = ?1 WHERE id = ?2",
                    sql_params![status.code(), key.value()],
                )?,
            };
            info!(%key, from = %row.status, to = %status, "Key status changed");
            Ok((self.store().get_key(key)?, plan))
        })
    }

    /// Rename a key.
    pub fn rename_key(&self, key: KeyId, name: &str) -> Result<Outcome<()>> {
        require_name("Key", name)?;
        let row = self.store().get_key(key)?;
        let plan = self.key_audience(&row)?;

        self.mutate("rename_key", &planned_ids(&plan), |tx| {
            tx.execute(
                "UPDATE keys SET name = ?1 WHERE id = ?2",
                sql_params![name, key.value()],
            )?;
            Ok(((), plan))
        })
    }

    /// Delete a key row and its material.
    ///
    /// # Errors
    /// - `Error::State` unless the key is preactive or destroyed
    pub fn delete_key(&self, key: KeyId) -> Result<Outcome<()>> {
        let row = self.store().get_key(key)?;
        if !matches!(row.status, KeyStatus::PreActive | KeyStatus::Destroyed) {
            return Err(Error::State(format!(
                "Key {} is {}; only preactive or destroyed keys can be deleted",
                key, row.status
            )));
        }
        let plan = self.key_audience(&row)?;

        self.mutate("delete_key", &planned_ids(&plan), |tx| {
            tx.execute("DELETE FROM keys WHERE id = ?1", sql_params![key.value()])?;
            info!(%key, "Key deleted");
            Ok(((), plan))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KmsConfig;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokenkms_crypto::{Algorithm, CryptoToken, LoginRole, SoftToken};

    const DB_KEY: u32 = 0xF000_0001;

    struct Admin {
        temp: TempDir,
        token: Arc<SoftToken>,
        session: Session,
    }

    fn admin() -> Admin {
        let temp = TempDir::new().unwrap();
        let token = Arc::new(SoftToken::new("SN-ADMIN", "1111", "2222"));
        token.login("2222", LoginRole::Admin).unwrap();
        token.generate_key(DB_KEY, 32).unwrap();
        token.generate_key(0xF000_0000, 32).unwrap();
        let updates = temp.path().join("updates");
        fs::create_dir(&updates).unwrap();
        let config = KmsConfig::admin(temp.path().join("kms.db"), DB_KEY, updates);
        let session = Session::open(config, token.clone()).unwrap();
        Admin { temp, token, session }
    }

    impl Admin {
        fn ops(&self) -> AdminOps<'_> {
            self.session.admin().unwrap()
        }

        fn user(&self, name: &str) -> UserRow {
            self.ops()
                .add_user(name, &format!("SN-{}", name), "0000", "9999")
                .unwrap()
                .value
                .0
        }

        fn updates(&self) -> std::path::PathBuf {
            self.temp.path().join("updates")
        }
    }

    #[test]
    fn test_add_user_writes_init_and_issues_keys() {
        let a = admin();
        let outcome = a.ops().add_user("alice", "SN-ALICE", "0000", "9999").unwrap();
        let (user, provisioning) = outcome.value;

        assert_eq!(outcome.report.delivered, vec![user.id]);
        assert!(a.token.has_key(user.k1).unwrap());
        assert!(a.token.has_key(user.k2).unwrap());
        assert_eq!(provisioning.k1, user.id.transport_key_id());
        assert!(!provisioning.wrapped_k1.is_empty());
        assert!(format!("{:?}", provisioning).contains("REDACTED"));
        assert!(update_path(&a.updates(), "SN-ALICE", UpdateFileKind::Init).exists());

        let stored = a.session.store().get_user(user.id).unwrap();
        assert!(stored.initialized);
        assert_eq!(stored.update_counter, 1);
        assert!(a.session.store().recovery_entries().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a = admin();
        a.user("alice");
        assert!(matches!(
            a.ops().add_user("alice", "SN-2", "", ""),
            Err(Error::AlreadyExists(_))
        ));
        a.ops().add_group("ops", GroupPolicy::default()).unwrap();
        assert!(matches!(
            a.ops().add_group("ops", GroupPolicy::default()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_key_follows_group_policy() {
        let a = admin();
        let policy = GroupPolicy {
            max_keys: 1,
            algorithm: Algorithm::Aes128,
            cryptoperiod: 3600,
        };
        let group = a.ops().add_group("small", policy).unwrap().value;
        let key = a.ops().add_key(group.id, "k", 0).unwrap().value;

        assert_eq!(key.algorithm, Algorithm::Aes128);
        assert_eq!(key.length, 16);
        assert_eq!(key.status, KeyStatus::PreActive);
        assert!(a.token.has_key(key.id.value()).unwrap());
        assert!(matches!(a.ops().add_key(group.id, "k2", 0), Err(Error::State(_))));
    }

    #[test]
    fn test_activation_window_and_reactivation() {
        let a = admin();
        let policy = GroupPolicy {
            cryptoperiod: 3600,
            ..GroupPolicy::default()
        };
        let group = a.ops().add_group("g", policy).unwrap().value;
        let key = a.ops().add_key(group.id, "k", 0).unwrap().value;

        let active = a.ops().activate_key(key.id).unwrap().value;
        assert_eq!(active.expires_at, active.activated_at + 3600);
        assert!(matches!(a.ops().activate_key(key.id), Err(Error::State(_))));

        let suspended = a.ops().change_status(key.id, KeyStatus::Suspended).unwrap().value;
        assert!(suspended.suspended_at > 0);
        let again = a.ops().change_status(key.id, KeyStatus::Active).unwrap().value;
        assert_eq!(again.activated_at, active.activated_at);
        assert_eq!(again.expires_at, active.expires_at);
    }

    #[test]
    fn test_destroy_removes_material() {
        let a = admin();
        let group = a.ops().add_group("g", GroupPolicy::default()).unwrap().value;
        let key = a.ops().add_key(group.id, "k", 0).unwrap().value;
        assert!(matches!(
            a.ops().change_status(key.id, KeyStatus::Suspended),
            Err(Error::State(_))
        ));

        let destroyed = a.ops().change_status(key.id, KeyStatus::Destroyed).unwrap().value;
        assert!(destroyed.destroyed_at > 0);
        assert!(!a.token.has_key(key.id.value()).unwrap());
        assert_eq!(a.session.store().get_group(group.id).unwrap().key_count, 0);

        a.ops().delete_key(key.id).unwrap();
        assert!(a.session.store().find_key(key.id).unwrap().is_none());
    }

    #[test]
    fn test_membership_deliveries() {
        let a = admin();
        let alice = a.user("alice");
        let bob = a.user("bob");
        let group = a.ops().add_group("g", GroupPolicy::default()).unwrap().value;
        a.ops().add_member(alice.id, group.id).unwrap();

        let outcome = a.ops().add_member(bob.id, group.id).unwrap();
        assert_eq!(outcome.report.delivered, vec![bob.id, alice.id]);
        assert!(update_path(&a.updates(), "SN-bob", UpdateFileKind::Recovery).exists());
        // alice got the membership statement and bob's sanitized row
        let alice_row = a.session.store().get_user(alice.id).unwrap();
        assert!(alice_row.update_counter > 0);

        let before = alice_row.update_counter;
        let outcome = a.ops().remove_member(bob.id, group.id).unwrap();
        assert_eq!(outcome.report.delivered.len(), 2);
        assert_eq!(a.session.store().get_user(alice.id).unwrap().update_counter, before + 1);
        assert!(matches!(
            a.ops().remove_member(bob.id, group.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_failed_delivery_blocks_until_recovery() {
        let a = admin();
        let alice = a.user("alice");
        let group = a.ops().add_group("g", GroupPolicy::default()).unwrap().value;
        a.ops().add_member(alice.id, group.id).unwrap();

        fs::remove_dir_all(a.updates()).unwrap();
        let outcome = a.ops().rename_group(group.id, "renamed").unwrap();
        assert_eq!(outcome.report.failed, vec![alice.id]);
        assert!(!outcome.report.is_complete());

        let err = a.ops().add_group("other", GroupPolicy::default()).unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
        assert!(err.needs_recovery());

        fs::create_dir(a.updates()).unwrap();
        let report = a.ops().process_recovery().unwrap();
        assert_eq!(report.delivered, vec![alice.id]);
        assert!(update_path(&a.updates(), "SN-alice", UpdateFileKind::Recovery).exists());
        a.ops().add_group("other", GroupPolicy::default()).unwrap();
    }

    #[test]
    fn test_unreachable_user_can_still_be_deleted() {
        let a = admin();
        let alice = a.user("alice");
        let bob = a.user("bob");
        let group = a.ops().add_group("g", GroupPolicy::default()).unwrap().value;
        a.ops().add_member(alice.id, group.id).unwrap();
        a.ops().add_member(bob.id, group.id).unwrap();

        for slot in ["SN-alice.normal", "SN-alice.recovery", "SN-alice.recovery.tmp"] {
            let path = a.updates().join(slot);
            if path.exists() {
                fs::remove_file(&path).unwrap();
            }
            fs::create_dir(&path).unwrap();
        }
        let outcome = a.ops().rename_group(group.id, "renamed").unwrap();
        assert_eq!(outcome.report.failed, vec![alice.id]);
        assert_eq!(a.ops().process_recovery().unwrap().failed, vec![alice.id]);
        assert!(matches!(
            a.ops().add_group("other", GroupPolicy::default()),
            Err(Error::Blocked(_))
        ));

        let outcome = a.ops().delete_user(alice.id).unwrap();
        assert_eq!(outcome.report.delivered, vec![bob.id]);
        assert!(a.session.store().recovery_entries().unwrap().is_empty());
        a.ops().add_group("other", GroupPolicy::default()).unwrap();
    }

    #[test]
    fn test_delete_user_removes_sync_keys() {
        let a = admin();
        let alice = a.user("alice");
        let bob = a.user("bob");
        let group = a.ops().add_group("g", GroupPolicy::default()).unwrap().value;
        a.ops().add_member(alice.id, group.id).unwrap();
        a.ops().add_member(bob.id, group.id).unwrap();

        let outcome = a.ops().delete_user(bob.id).unwrap();
        assert_eq!(outcome.report.delivered, vec![bob.id, alice.id]);
        assert!(a.session.store().find_user(bob.id).unwrap().is_none());
        assert_eq!(a.session.store().group_members(group.id).unwrap(), vec![alice.id]);
        assert!(!a.token.has_key(bob.k1).unwrap());
        assert!(!a.token.has_key(bob.k2).unwrap());
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let a = admin();
        let policy = GroupPolicy {
            max_keys: 0,
            ..GroupPolicy::default()
        };
        assert!(matches!(a.ops().add_group("g", policy), Err(Error::Parameter(_))));
        assert!(matches!(
            a.ops().add_group(" ", GroupPolicy::default()),
            Err(Error::Parameter(_))
        ));
    }
}
