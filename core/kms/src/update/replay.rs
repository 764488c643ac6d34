//! Applying update files on a user device.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use tokenkms_common::{Error, GroupId, Result, UserId};

use crate::model::UserRow;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::schema::REPLICATED_TABLES;
use crate::sql_params;
use crate::status::KeyStatus;
use crate::store::KeyStore;
use crate::transaction::Transaction;
use crate::update::record::{RecordBody, UpdateRecord};
use crate::update::writer::{read_update_file, update_path, UpdateFileKind};

/// Summary of one update pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Files replayed and removed, in processing order.
    pub files: Vec<UpdateFileKind>,
    /// Records applied.
    pub applied: usize,
    /// Records skipped as already applied.
    pub skipped: usize,
    /// Counter stored after the pass.
    pub counter: u64,
}

/// Counts of one replayed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    /// Records applied.
    pub applied: usize,
    /// Records skipped.
    pub skipped: usize,
}

/// Remove a group, leaving its keys as deactivated zombies.
pub(crate) fn orphan_group(tx: &Transaction<'_>, group: GroupId, deactivated_at: i64) -> Result<()> {
    tx.execute_local(
        "UPDATE keys SET status = ?1, deactivated_at = ?2
         WHERE owner_group = ?3 AND status IN (?4, ?5, ?6)",
        sql_params![
            KeyStatus::Deactivated.code(),
            deactivated_at,
            group.value(),
            KeyStatus::PreActive.code(),
            KeyStatus::Active.code(),
            KeyStatus::Suspended.code(),
        ],
    )?;
    tx.execute_local(
        "UPDATE keys SET owner_group = NULL WHERE owner_group = ?1",
        sql_params![group.value()],
    )?;
    tx.execute_local(
        "DELETE FROM user_groups WHERE group_id = ?1",
        sql_params![group.value()],
    )?;
    tx.execute_local("DELETE FROM key_groups WHERE id = ?1", sql_params![group.value()])?;
    Ok(())
}

/// Forget a group with its memberships and keys.
fn drop_group(tx: &Transaction<'_>, group: GroupId) -> Result<()> {
    tx.execute_local("DELETE FROM keys WHERE owner_group = ?1", sql_params![group.value()])?;
    tx.execute_local(
        "DELETE FROM user_groups WHERE group_id = ?1",
        sql_params![group.value()],
    )?;
    tx.execute_local("DELETE FROM key_groups WHERE id = ?1", sql_params![group.value()])?;
    Ok(())
}

/// Delete a user row and its memberships.
pub(crate) fn drop_user(tx: &Transaction<'_>, user: UserId) -> Result<()> {
    tx.execute_local("DELETE FROM user_groups WHERE user_id = ?1", sql_params![user.value()])?;
    tx.execute_local("DELETE FROM users WHERE id = ?1", sql_params![user.value()])?;
    Ok(())
}

/// Delete one membership.
pub(crate) fn drop_membership(tx: &Transaction<'_>, user: UserId, group: GroupId) -> Result<usize> {
    tx.execute_local(
        "DELETE FROM user_groups WHERE user_id = ?1 AND group_id = ?2",
        sql_params![user.value(), group.value()],
    )
}

fn wipe(tx: &Transaction<'_>) -> Result<()> {
    for table in REPLICATED_TABLES {
        tx.execute_local(&format!("DELETE FROM {}", table), sql_params![])?;
    }
    Ok(())
}

fn own_user(store: &KeyStore) -> Result<Option<UserRow>> {
    store.user_by_serial(store.token().serial_number())
}

fn apply_body(store: &KeyStore, tx: &Transaction<'_>, body: &RecordBody) -> Result<()> {
    match body {
        RecordBody::Statement(statement) => {
            statement.apply(tx.conn())?;
        }
        RecordBody::RemoveUserFromGroup { user, group } => {
            if own_user(store)?.is_some_and(|own| own.id == *user) {
                drop_group(tx, *group)?;
            } else {
                drop_membership(tx, *user, *group)?;
            }
        }
        RecordBody::RemoveUser(user) => {
            if own_user(store)?.is_some_and(|own| own.id == *user) {
                warn!(%user, "Own user removed, wiping device store");
                wipe(tx)?;
            } else {
                drop_user(tx, *user)?;
            }
        }
        RecordBody::RemoveGroup {
            group,
            deactivated_at,
        } => orphan_group(tx, *group, *deactivated_at)?,
        RecordBody::DeliverKey { key_id, wrapped } => {
            let own = own_user(store)?.ok_or_else(|| {
                Error::State("Key delivered before the device user is known".to_string())
            })?;
            store
                .token()
                .insert_wrapped_key(key_id.value(), own.k2, wrapped)?;
            debug!(key_id = %key_id, "Key material installed");
        }
        RecordBody::Reset => wipe(tx)?,
    }
    Ok(())
}

/// Apply `records` in order inside `tx`.
///
/// A reset applies unconditionally and sets the counter to 0. Records at or
/// below the stored counter are skipped; the next counter is applied.
///
/// # Errors
/// - `Error::OutOfSequence` if a record skips ahead of the stored counter
pub fn apply_records(store: &KeyStore, tx: &Transaction<'_>, records: &[UpdateRecord]) -> Result<FileStats> {
    let mut stored = store.device_counter()?;
    let mut stats = FileStats::default();

    for record in records {
        if record.body == RecordBody::Reset {
            apply_body(store, tx, &record.body)?;
            stored = 0;
        } else if record.counter <= stored {
            stats.skipped += 1;
            continue;
        } else if record.counter == stored + 1 {
            apply_body(store, tx, &record.body)?;
            stored = record.counter;
        } else {
            return Err(Error::OutOfSequence {
                stored,
                found: record.counter,
            });
        }
        KeyStore::set_device_counter(tx, stored)?;
        stats.applied += 1;
    }
    Ok(stats)
}

/// Replay one update file in a single transaction.
///
/// # Postconditions
/// - On error nothing was committed
pub fn replay_file(store: &KeyStore, policy: &RetryPolicy, path: &Path) -> Result<FileStats> {
    let records = read_update_file(store.token(), path)?;
    let tx = Transaction::begin(store.conn(), policy)?;
    match apply_records(store, &tx, &records) {
        Ok(stats) => {
            tx.commit()?;
            Ok(stats)
        }
        Err(err) => {
            tx.rollback()?;
            Err(err)
        }
    }
}

/// Replay every pending update file of this device, in precedence order.
///
/// Each file is removed once its replay is committed and persisted.
///
/// # Errors
/// - `Error::OutOfSequence` if a recovery file is required
/// - `Error::RestartRequired` if a committed replay could not be persisted
pub fn process_updates(store: &KeyStore, update_dir: &Path, policy: &RetryPolicy) -> Result<ReplayReport> {
    let serial = store.token().serial_number().to_string();
    let mut report = ReplayReport::default();

    for kind in UpdateFileKind::PRECEDENCE {
        let path = update_path(update_dir, &serial, kind);
        if !path.exists() {
            continue;
        }

        let stats = RetryExecutor::new(policy.replay_attempts, policy.backoff())
            .execute("replay", || replay_file(store, policy, &path))
            .inspect_err(|e| warn!(%kind, error = %e, "Update replay failed"))?;

        store.persist().map_err(|e| {
            error!(error = %e, "Replayed state could not be persisted");
            Error::RestartRequired(format!("Persisting replayed state failed: {}", e))
        })?;
        fs::remove_file(&path)?;
        store.reconcile_token()?;

        info!(%kind, applied = stats.applied, skipped = stats.skipped, "Update file replayed");
        report.files.push(kind);
        report.applied += stats.applied;
        report.skipped += stats.skipped;
    }

    report.counter = store.device_counter()?;
    Ok(report)
}
