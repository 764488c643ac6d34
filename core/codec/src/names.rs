//! On-disk name obfuscation and secure directories.
//!
//! A file is stored under the hex SHA-256 digest of its logical name; the
//! name itself lives in the encrypted header. A directory is stored under
//! `{key_id:08x}` followed by the hex AES-ECB encryption of its zero-padded
//! name, so it can be revealed again by anyone holding the key.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tokenkms_common::{Error, Result};
use tokenkms_crypto::{Algorithm, CipherMode, CipherParams, CryptoToken, Direction, BLOCK_SIZE};

use crate::file::{OpenMode, SectorCodec};
use crate::gate::KeyGate;
use crate::layout::SectorLayout;
use crate::medium::FileMedium;
use crate::sector::run_session;

const KEY_PREFIX_LEN: usize = 8;

/// On-disk name of a file.
pub fn file_name(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

fn is_stored_file_name(stored: &str) -> bool {
    stored.len() == 64 && stored.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn key_algorithm(token: &dyn CryptoToken, key_id: u32) -> Result<Algorithm> {
    let info = token
        .list_keys()?
        .into_iter()
        .find(|k| k.id == key_id)
        .ok_or_else(|| Error::NotFound(format!("Token key {} not found", key_id)))?;
    Algorithm::from_key_len(info.length)
}

/// On-disk name of a directory encrypted under `key_id`.
///
/// # Errors
/// - Empty names or names containing NUL
/// - The gate refuses the key for encryption
pub fn dir_name(
    token: &dyn CryptoToken,
    gate: &dyn KeyGate,
    key_id: u32,
    name: &str,
) -> Result<String> {
    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(Error::Parameter(format!("Invalid directory name {:?}", name)));
    }
    gate.check(key_id, Direction::Encrypt)?;
    let algorithm = key_algorithm(token, key_id)?;

    let mut block = name.as_bytes().to_vec();
    block.resize(name.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    let params = CipherParams::new(key_id, algorithm, CipherMode::Ecb, Direction::Encrypt);
    run_session(token, &params, &mut block)?;

    Ok(format!("{:08x}{}", key_id, hex::encode(block)))
}

/// Recover the key id and logical name of an obfuscated directory name.
///
/// # Errors
/// - `Error::Parameter` if `encoded` is not a directory name
/// - The gate refuses the key for decryption
pub fn reveal_dir_name(
    token: &dyn CryptoToken,
    gate: &dyn KeyGate,
    encoded: &str,
) -> Result<(u32, String)> {
    let malformed = || Error::Parameter(format!("Not an encrypted directory name: {}", encoded));
    if encoded.len() <= KEY_PREFIX_LEN || !encoded.is_ascii() {
        return Err(malformed());
    }
    let (prefix, body) = encoded.split_at(KEY_PREFIX_LEN);
    let key_id = u32::from_str_radix(prefix, 16).map_err(|_| malformed())?;
    let mut block = hex::decode(body).map_err(|_| malformed())?;
    if block.len() % BLOCK_SIZE != 0 {
        return Err(malformed());
    }

    gate.check(key_id, Direction::Decrypt)?;
    let algorithm = key_algorithm(token, key_id)?;
    let params = CipherParams::new(key_id, algorithm, CipherMode::Ecb, Direction::Decrypt);
    run_session(token, &params, &mut block)?;

    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    let name = String::from_utf8(block[..end].to_vec()).map_err(|_| malformed())?;
    Ok((key_id, name))
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Encrypted file.
    File,
    /// Encrypted directory.
    Directory,
}

/// A revealed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Logical name.
    pub name: String,
    /// Name on disk.
    pub stored_name: String,
    /// Key protecting the entry.
    pub key_id: u32,
    /// File or directory.
    pub kind: EntryKind,
}

/// Directory tree with obfuscated names.
pub struct SecureDir<'a> {
    root: PathBuf,
    token: &'a dyn CryptoToken,
    gate: &'a dyn KeyGate,
}

impl<'a> SecureDir<'a> {
    /// Wrap an existing directory.
    ///
    /// # Errors
    /// - `root` is not a directory
    pub fn new(root: impl AsRef<Path>, token: &'a dyn CryptoToken, gate: &'a dyn KeyGate) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::NotFound(format!("Directory not found: {}", root.display())));
        }
        Ok(Self { root, token, gate })
    }

    /// Path of the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical path of a file named `name` inside `dir`.
    pub fn file_path(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(file_name(name))
    }

    /// Create a subdirectory of `parent` whose name is encrypted under `key_id`.
    pub fn create_dir(&self, parent: &Path, key_id: u32, name: &str) -> Result<PathBuf> {
        let path = parent.join(dir_name(self.token, self.gate, key_id, name)?);
        if path.exists() {
            return Err(Error::AlreadyExists(format!("Directory {} exists", name)));
        }
        fs::create_dir(&path)?;
        debug!(key_id, "Created encrypted directory");
        Ok(path)
    }

    /// List `dir`, revealing directory names and reading file headers.
    ///
    /// Entries that cannot be revealed with the available keys are skipped.
    ///
    /// # Errors
    /// - `Error::Integrity` if a file stored under a hashed name fails
    ///   verification or its header names a different file
    pub fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let codec = SectorCodec::new(self.token, SectorLayout::STANDARD);
        let mut entries = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let stored_name = entry.file_name().to_string_lossy().into_owned();

            let is_dir = entry.file_type()?.is_dir();
            let revealed = if is_dir {
                reveal_dir_name(self.token, self.gate, &stored_name).map(|(key_id, name)| DirEntry {
                    name,
                    stored_name: stored_name.clone(),
                    key_id,
                    kind: EntryKind::Directory,
                })
            } else {
                FileMedium::open(entry.path(), false)
                    .and_then(|medium| codec.open(medium, self.gate, OpenMode::Read))
                    .and_then(|file| {
                        if file_name(file.name()) != stored_name {
                            return Err(Error::Integrity(format!(
                                "File {} is stored under a foreign name",
                                file.name()
                            )));
                        }
                        Ok(DirEntry {
                            name: file.name().to_string(),
                            stored_name: stored_name.clone(),
                            key_id: file.key_id(),
                            kind: EntryKind::File,
                        })
                    })
            };

            match revealed {
                Ok(e) => entries.push(e),
                Err(e @ Error::Integrity(_)) if !is_dir && is_stored_file_name(&stored_name) => {
                    return Err(e);
                }
                Err(e) => warn!(entry = %stored_name, error = %e, "Skipping unreadable entry"),
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove the file named `name` from `dir`.
    pub fn remove_file(&self, dir: &Path, name: &str) -> Result<()> {
        let path = self.file_path(dir, name);
        if !path.exists() {
            return Err(Error::NotFound(format!("File {} not found", name)));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// Remove the directory named `name` from `parent` with all its content.
    pub fn remove_dir(&self, parent: &Path, key_id: u32, name: &str) -> Result<()> {
        let path = parent.join(dir_name(self.token, self.gate, key_id, name)?);
        if !path.is_dir() {
            return Err(Error::NotFound(format!("Directory {} not found", name)));
        }
        fs::remove_dir_all(path)?;
        Ok(())
    }
}
