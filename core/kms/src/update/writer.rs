//! Update files: naming, encryption and full-state content.

use std::fmt;
use std::fs;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tokenkms_codec::{AlwaysValid, FileMedium, NewFile, OpenMode, SectorCodec, SectorLayout};
use tokenkms_common::{Error, Result};
use tokenkms_crypto::{Algorithm, CryptoToken};

use crate::model::{membership_statement, UserRow};
use crate::status::KeyStatus;
use crate::store::KeyStore;
use crate::update::record::{RecordBody, UpdateRecord};

/// Algorithm of the per-user synchronization keys.
pub const SYNC_ALGORITHM: Algorithm = Algorithm::Aes256;

/// Class of an update file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateFileKind {
    /// One-time bootstrap with the full state.
    Init,
    /// Full-state resynchronization superseding everything local.
    Recovery,
    /// Incremental, counter-ordered records.
    Normal,
}

impl UpdateFileKind {
    /// Processing order on the device.
    pub const PRECEDENCE: [UpdateFileKind; 3] = [
        UpdateFileKind::Init,
        UpdateFileKind::Recovery,
        UpdateFileKind::Normal,
    ];

    /// File name extension.
    pub fn extension(&self) -> &'static str {
        match self {
            UpdateFileKind::Init => "init",
            UpdateFileKind::Recovery => "recovery",
            UpdateFileKind::Normal => "normal",
        }
    }

    /// Whether the file carries the complete state.
    pub fn is_full_state(&self) -> bool {
        !matches!(self, UpdateFileKind::Normal)
    }
}

impl fmt::Display for UpdateFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Path of a user's update file.
pub fn update_path(dir: &Path, serial: &str, kind: UpdateFileKind) -> PathBuf {
    dir.join(format!("{}.{}", serial, kind.extension()))
}

fn transport(path: &Path, err: Error) -> Error {
    match err {
        Error::Io(e) => Error::Transport(format!("{}: {}", path.display(), e)),
        Error::NotFound(e) => Error::Transport(e),
        other => other,
    }
}

/// Write records to the update file of `user`.
///
/// Normal files are appended to. Full-state files are written beside the
/// target and renamed over it, so a reader never sees a partial one.
///
/// # Preconditions
/// - The user's transport key is present on `token`
pub fn write_update_file(
    token: &dyn CryptoToken,
    dir: &Path,
    user: &UserRow,
    kind: UpdateFileKind,
    records: &[UpdateRecord],
) -> Result<PathBuf> {
    let body = UpdateRecord::encode_all(records)?;
    let path = update_path(dir, &user.serial, kind);
    let name = format!("{}.{}", user.serial, kind.extension());
    let new = NewFile {
        key_id: user.k1,
        algorithm: SYNC_ALGORITHM,
        name: &name,
    };
    let codec = SectorCodec::new(token, SectorLayout::STANDARD);

    if kind.is_full_state() {
        let staging = dir.join(format!("{}.tmp", name));
        let medium = FileMedium::create(&staging).map_err(|e| transport(&staging, e))?;
        let mut file = codec.create(medium, AlwaysValid, new)?;
        file.write(&body)?;
        file.close()?;
        fs::rename(&staging, &path).map_err(|e| transport(&path, e.into()))?;
    } else {
        let mut file = codec
            .open_path(&path, AlwaysValid, OpenMode::ReadWrite, Some(new))
            .map_err(|e| transport(&path, e))?;
        file.seek(SeekFrom::End(0))?;
        file.write(&body)?;
        file.close()?;
    }

    debug!(user = %user.id, %kind, records = records.len(), "Update file written");
    Ok(path)
}

/// Read and decode an update file.
///
/// # Errors
/// - `Error::Transport` if the file is missing, unreadable or malformed
/// - `Error::Integrity` if a sector fails verification
pub fn read_update_file(token: &dyn CryptoToken, path: &Path) -> Result<Vec<UpdateRecord>> {
    let codec = SectorCodec::new(token, SectorLayout::STANDARD);
    let mut file = codec
        .open_path(path, AlwaysValid, OpenMode::Read, None)
        .map_err(|e| transport(path, e))?;
    let body = file.read_all()?;
    file.close()?;
    UpdateRecord::decode_all(&body)
}

/// Number `bodies` consecutively after `last_counter`.
pub fn numbered(last_counter: u64, bodies: Vec<RecordBody>) -> Vec<UpdateRecord> {
    bodies
        .into_iter()
        .zip(last_counter + 1..)
        .map(|(body, counter)| UpdateRecord::new(counter, body))
        .collect()
}

/// Complete state visible to `user`, starting with a reset.
///
/// Contains the user's own row, its groups with all their memberships, the
/// sanitized rows of co-members, the groups' keys and the key material of
/// every key that was not destroyed, wrapped with the user's wrapping key.
pub fn full_state_records(store: &KeyStore, user: &UserRow) -> Result<Vec<UpdateRecord>> {
    let mut bodies = vec![RecordBody::Statement(user.upsert_statement())];

    let groups = store.user_groups(user.id)?;
    let mut co_members = Vec::new();
    for group in &groups {
        bodies.push(RecordBody::Statement(store.get_group(*group)?.upsert_statement()));
        for member in store.group_members(*group)? {
            bodies.push(RecordBody::Statement(membership_statement(member, *group)));
            if member != user.id && !co_members.contains(&member) {
                co_members.push(member);
            }
        }
    }
    co_members.sort();
    for member in co_members {
        let row = store.get_user(member)?.sanitized();
        bodies.push(RecordBody::Statement(row.upsert_statement()));
    }

    let mut deliveries = Vec::new();
    for group in &groups {
        for key in store.group_keys(*group)? {
            bodies.push(RecordBody::Statement(key.upsert_statement()));
            if key.status != KeyStatus::Destroyed {
                deliveries.push(RecordBody::DeliverKey {
                    key_id: key.id,
                    wrapped: store.token().export_wrapped_key(key.id.value(), user.k2)?,
                });
            }
        }
    }
    bodies.extend(deliveries);

    let mut records = vec![UpdateRecord::new(0, RecordBody::Reset)];
    records.extend(numbered(0, bodies));
    Ok(records)
}
