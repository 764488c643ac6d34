//! Physical media holding encrypted sectors.
//!
//! The codec only needs positioned reads and writes plus length control, so
//! a medium is anything that can provide those: a local file or a buffer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokenkms_common::{Error, Result};

/// Random-access storage of ciphertext sectors.
///
/// Every encrypted file exclusively owns its medium.
pub trait SectorMedium {
    /// Fill `buf` from `offset`.
    ///
    /// # Errors
    /// - Reading past the end of the medium
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`, growing the medium if needed.
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current physical length.
    fn len(&self) -> Result<u64>;

    /// Whether the medium holds no bytes.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Cut or extend the medium to `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Flush buffered data to durable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Local filesystem medium.
pub struct FileMedium {
    file: File,
    path: PathBuf,
}

impl FileMedium {
    /// Open an existing file.
    ///
    /// # Errors
    /// - File does not exist
    /// - Permission denied
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path.display())));
        }
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        Ok(Self { file, path })
    }

    /// Create a file, replacing any existing content.
    ///
    /// # Errors
    /// - Parent directory does not exist
    /// - Permission denied
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Path this medium was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SectorMedium for FileMedium {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory medium.
///
/// Clones share the same buffer, which lets tests inspect or corrupt the
/// ciphertext of a file they handed to the codec.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryMedium {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.read_lock()?.clone())
    }

    /// Mutate the raw bytes in place.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<R> {
        let mut data = self
            .data
            .write()
            .map_err(|_| Error::Storage("Memory medium lock poisoned".to_string()))?;
        Ok(f(&mut data))
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<u8>>> {
        self.data
            .read()
            .map_err(|_| Error::Storage("Memory medium lock poisoned".to_string()))
    }
}

impl SectorMedium for MemoryMedium {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.read_lock()?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("Read of {}..{} past end {}", start, end, data.len()),
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.with_bytes_mut(|data| {
            let start = offset as usize;
            let end = start + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.read_lock()?.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.with_bytes_mut(|data| data.resize(len as usize, 0))
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
