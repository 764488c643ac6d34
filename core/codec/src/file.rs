//! Random-access encrypted files.

use std::io::SeekFrom;
use std::path::Path;

use tracing::{debug, warn};

use tokenkms_common::{Error, Result};
use tokenkms_crypto::{Algorithm, CryptoToken, Direction};

use crate::gate::KeyGate;
use crate::header::FileHeader;
use crate::layout::SectorLayout;
use crate::medium::{FileMedium, SectorMedium};
use crate::sector::{self, SectorPayload};

/// Access mode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only.
    Read,
    /// Reads and writes.
    ReadWrite,
}

/// Parameters for creating a new file.
#[derive(Debug, Clone, Copy)]
pub struct NewFile<'n> {
    /// Token key id that will encrypt the file.
    pub key_id: u32,
    /// Algorithm of that key.
    pub algorithm: Algorithm,
    /// Logical name recorded in the header.
    pub name: &'n str,
}

/// Factory for encrypted files sharing a token and a sector layout.
#[derive(Clone, Copy)]
pub struct SectorCodec<'a> {
    token: &'a dyn CryptoToken,
    layout: SectorLayout,
}

impl<'a> SectorCodec<'a> {
    /// Create a codec over `token` with the given layout.
    pub fn new(token: &'a dyn CryptoToken, layout: SectorLayout) -> Self {
        Self { token, layout }
    }

    /// Layout used for files of this codec.
    pub fn layout(&self) -> SectorLayout {
        self.layout
    }

    /// Create a new empty file on `medium`, discarding its content.
    ///
    /// # Preconditions
    /// - The key is present on the token
    ///
    /// # Postconditions
    /// - The medium holds exactly one header sector
    ///
    /// # Errors
    /// - The gate refuses the key for encryption
    /// - Name too long for the layout
    pub fn create<M: SectorMedium>(
        &self,
        mut medium: M,
        gate: impl KeyGate + 'a,
        new: NewFile<'_>,
    ) -> Result<EncryptedFile<'a, M>> {
        gate.check(new.key_id, Direction::Encrypt)?;
        let header = FileHeader::generate(self.token, &self.layout, new.key_id, new.algorithm, new.name)?;
        let sector = header.seal(self.token, &self.layout)?;

        medium.set_len(0)?;
        medium.write_all_at(0, &sector)?;
        debug!(key_id = new.key_id, "Created encrypted file");

        Ok(EncryptedFile {
            token: self.token,
            gate: Box::new(gate),
            layout: self.layout,
            medium: Some(medium),
            header,
            mode: OpenMode::ReadWrite,
            position: 0,
            length: 0,
        })
    }

    /// Open an existing file on `medium`.
    ///
    /// # Errors
    /// - `Error::Integrity` on a corrupt header, a torn sector or a
    ///   signature mismatch
    /// - The gate refuses the key for decryption
    pub fn open<M: SectorMedium>(
        &self,
        mut medium: M,
        gate: impl KeyGate + 'a,
        mode: OpenMode,
    ) -> Result<EncryptedFile<'a, M>> {
        let sector_size = self.layout.sector_size();
        let physical = medium.len()?;
        if physical < sector_size as u64 {
            return Err(Error::Integrity("File is shorter than its header".to_string()));
        }

        let mut raw = vec![0u8; sector_size];
        medium.read_exact_at(0, &mut raw)?;
        let (key_id, _) = FileHeader::peek(&raw)?;
        gate.check(key_id, Direction::Decrypt)?;
        if mode == OpenMode::ReadWrite {
            gate.check(key_id, Direction::Encrypt)?;
        }
        let header = FileHeader::open(self.token, &self.layout, raw)?;

        let mut file = EncryptedFile {
            token: self.token,
            gate: Box::new(gate),
            layout: self.layout,
            medium: Some(medium),
            header,
            mode,
            position: 0,
            length: 0,
        };
        file.length = file.derive_length(physical)?;
        Ok(file)
    }

    /// Open a file by path, creating it when absent and `create` is given.
    ///
    /// # Errors
    /// - `Error::NotFound` if the file is absent and `create` is `None`
    pub fn open_path(
        &self,
        path: impl AsRef<Path>,
        gate: impl KeyGate + 'a,
        mode: OpenMode,
        create: Option<NewFile<'_>>,
    ) -> Result<EncryptedFile<'a, FileMedium>> {
        let path = path.as_ref();
        match create {
            Some(new) if !path.exists() => self.create(FileMedium::create(path)?, gate, new),
            _ => {
                let medium = FileMedium::open(path, mode == OpenMode::ReadWrite)?;
                self.open(medium, gate, mode)
            }
        }
    }
}

/// An open encrypted file.
///
/// Logical offsets address payload bytes only; the header and the per-sector
/// overhead are invisible to callers.
pub struct EncryptedFile<'a, M: SectorMedium> {
    token: &'a dyn CryptoToken,
    gate: Box<dyn KeyGate + 'a>,
    layout: SectorLayout,
    medium: Option<M>,
    header: FileHeader,
    mode: OpenMode,
    position: u64,
    length: u64,
}

impl<'a, M: SectorMedium> EncryptedFile<'a, M> {
    /// Token key id of the file.
    pub fn key_id(&self) -> u32 {
        self.header.key_id
    }

    /// Algorithm of the file key.
    pub fn algorithm(&self) -> Algorithm {
        self.header.algorithm
    }

    /// Logical name recorded in the header.
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Whether the file is still open.
    pub fn is_open(&self) -> bool {
        self.medium.is_some()
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the file holds no payload.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current logical position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns the number of bytes read; 0 at end of file.
    ///
    /// # Errors
    /// - `Error::Integrity` if a sector fails verification
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }

        let total = buf.len().min((self.length - self.position) as usize);
        let mut done = 0;
        while done < total {
            let (index, within) = self.layout.locate(self.position);
            let sector = self.load_sector(index)?;
            let take = (self.layout.payload_size() - within).min(total - done);
            buf[done..done + take].copy_from_slice(&sector.data[within..within + take]);
            done += take;
            self.position += take as u64;
        }
        Ok(done)
    }

    /// Write all of `buf` at the current position.
    ///
    /// # Errors
    /// - `Error::State` if the file is read-only or closed
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        if self.position > self.length {
            self.extend_to(self.position)?;
        }
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    /// Move the logical position.
    ///
    /// Seeking past the end of a writable file zero-fills up to the new
    /// position.
    ///
    /// # Errors
    /// - `Error::Parameter` for positions before the start, or past the end
    ///   of a read-only file
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.position as i128 + d as i128,
            SeekFrom::End(d) => self.length as i128 + d as i128,
        };
        if target < 0 {
            return Err(Error::Parameter(format!("Seek to negative position {}", target)));
        }
        let target = u64::try_from(target)
            .map_err(|_| Error::Parameter(format!("Seek position {} out of range", target)))?;

        if target > self.length {
            if self.mode != OpenMode::ReadWrite {
                return Err(Error::Parameter(format!(
                    "Seek to {} past end {} of read-only file",
                    target, self.length
                )));
            }
            self.extend_to(target)?;
        }
        self.position = target;
        Ok(target)
    }

    /// Set the logical length.
    ///
    /// Growing zero-fills; shrinking cuts at a sector boundary and rewrites
    /// the new tail sector. The position is left unchanged.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        if size >= self.length {
            return self.extend_to(size);
        }

        let keep = self.layout.sectors_for(size);
        let tail = if keep > 0 {
            let index = keep - 1;
            let mut sector = self.load_sector(index)?;
            let used = (size - index * self.layout.payload_size() as u64) as usize;
            sector.data[used..].fill(0);
            sector.used = used;
            Some((index, sector))
        } else {
            None
        };

        let physical = self.layout.sector_offset(keep);
        self.medium_mut()?.set_len(physical)?;
        if let Some((index, sector)) = tail {
            self.store_sector(index, &sector)?;
        }
        self.length = size;
        debug!(size, "Truncated encrypted file");
        Ok(())
    }

    /// Flush and release the medium. Further operations fail.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut medium) = self.medium.take() {
            medium.sync()?;
        }
        Ok(())
    }

    /// Read the whole logical content from the start.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut out = vec![0u8; self.length as usize];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.medium.is_none() {
            return Err(Error::State("File is closed".to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::State("File is opened read-only".to_string()));
        }
        Ok(())
    }

    fn medium_mut(&mut self) -> Result<&mut M> {
        self.medium
            .as_mut()
            .ok_or_else(|| Error::State("File is closed".to_string()))
    }

    fn derive_length(&mut self, physical: u64) -> Result<u64> {
        let sector = self.layout.sector_size() as u64;
        let data = physical - sector;
        if data % sector != 0 {
            return Err(Error::Integrity(format!(
                "Physical length {} is not a whole number of sectors",
                physical
            )));
        }
        let count = data / sector;
        if count == 0 {
            return Ok(0);
        }
        let last = self.load_sector(count - 1)?;
        if last.used == 0 {
            warn!(key_id = self.header.key_id, "Trailing sector holds no data");
        }
        Ok((count - 1) * self.layout.payload_size() as u64 + last.used as u64)
    }

    fn sector_count(&self) -> u64 {
        self.layout.sectors_for(self.length)
    }

    fn load_sector(&mut self, index: u64) -> Result<SectorPayload> {
        self.gate.check(self.header.key_id, Direction::Decrypt)?;
        let offset = self.layout.sector_offset(index);
        let mut raw = vec![0u8; self.layout.sector_size()];
        self.medium_mut()?.read_exact_at(offset, &mut raw)?;
        sector::open(self.token, &self.header, &self.layout, index, raw)
    }

    fn store_sector(&mut self, index: u64, payload: &SectorPayload) -> Result<()> {
        self.gate.check(self.header.key_id, Direction::Encrypt)?;
        let raw = sector::seal(self.token, &self.header, &self.layout, index, payload)?;
        let offset = self.layout.sector_offset(index);
        self.medium_mut()?.write_all_at(offset, &raw)
    }

    fn write_at(&mut self, start: u64, buf: &[u8]) -> Result<()> {
        let payload_size = self.layout.payload_size();
        let mut done = 0;
        while done < buf.len() {
            let at = start + done as u64;
            let (index, within) = self.layout.locate(at);
            let take = (payload_size - within).min(buf.len() - done);

            let mut sector = if within == 0 && take == payload_size {
                SectorPayload::empty(&self.layout)
            } else if index < self.sector_count() {
                self.load_sector(index)?
            } else {
                SectorPayload::empty(&self.layout)
            };
            sector.data[within..within + take].copy_from_slice(&buf[done..done + take]);
            sector.used = sector.used.max(within + take);
            self.store_sector(index, &sector)?;

            done += take;
            self.length = self.length.max(at + take as u64);
        }
        Ok(())
    }

    fn extend_to(&mut self, target: u64) -> Result<()> {
        if target <= self.length {
            return Ok(());
        }
        let zeros = vec![0u8; self.layout.payload_size()];
        while self.length < target {
            let take = ((target - self.length) as usize).min(zeros.len());
            let at = self.length;
            self.write_at(at, &zeros[..take])?;
        }
        Ok(())
    }
}

fn to_io(e: Error) -> std::io::Error {
    match e {
        Error::Io(inner) => inner,
        other => std::io::Error::other(other),
    }
}

impl<M: SectorMedium> std::io::Read for EncryptedFile<'_, M> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        EncryptedFile::read(self, buf).map_err(to_io)
    }
}

impl<M: SectorMedium> std::io::Write for EncryptedFile<'_, M> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        EncryptedFile::write(self, buf).map_err(to_io)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.medium_mut().and_then(|m| m.sync()).map_err(to_io)
    }
}

impl<M: SectorMedium> std::io::Seek for EncryptedFile<'_, M> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        EncryptedFile::seek(self, pos).map_err(to_io)
    }
}
