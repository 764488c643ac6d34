//! Store-and-forward distribution of key store changes.
//!
//! The administrator writes per-user update files into a shared directory,
//! encrypted with the user's transport key. Each device replays its own files
//! in the order init, recovery, normal.

pub mod record;
pub mod replay;
pub mod writer;

pub use record::{RecordBody, UpdateRecord};
pub use replay::{apply_records, process_updates, replay_file, FileStats, ReplayReport};
pub use writer::{
    full_state_records, numbered, read_update_file, update_path, write_update_file, UpdateFileKind,
    SYNC_ALGORITHM,
};
