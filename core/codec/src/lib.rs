//! Encrypted sector file format.
//!
//! Files are split into fixed-size sectors, each encrypted by the token and
//! carrying its own signature, so any byte range can be read or rewritten
//! without touching the rest of the file. Two layouts exist: a general one
//! with 512-byte sectors and a database one whose payload is exactly 4096
//! bytes per sector.

pub mod file;
pub mod gate;
pub mod header;
pub mod layout;
pub mod medium;
pub mod names;
mod sector;

pub use file::{EncryptedFile, NewFile, OpenMode, SectorCodec};
pub use gate::{AlwaysValid, KeyGate};
pub use header::FileHeader;
pub use layout::{add_counter_offset, SectorLayout};
pub use medium::{FileMedium, MemoryMedium, SectorMedium};
pub use names::{dir_name, file_name, reveal_dir_name, DirEntry, EntryKind, SecureDir};
