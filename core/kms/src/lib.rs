//! Token-based key management.
//!
//! This module provides:
//! - An encrypted SQLite key store persisted through the sector codec
//! - The key lifecycle state machine and the validity gate it drives
//! - Administrator mutations that record every change as replayable statements
//! - Store-and-forward update files replayed on user devices
//! - Key selection for one receiver, a group or a set of receivers
//!
//! Every operation runs inside a [`Session`], which binds a role, a token and
//! an opened store.

pub mod admin;
pub mod config;
pub mod gate;
pub mod model;
pub mod retry;
pub mod schema;
pub mod selection;
pub mod session;
pub mod status;
pub mod store;
pub mod transaction;
pub mod update;

pub use admin::{AdminOps, DeviceProvisioning, DistributionReport, Outcome};
pub use config::{KmsConfig, Role, DEFAULT_GATE_TTL, DEFAULT_TRANSFER_KEY_ID};
pub use gate::{GateCache, ValidityGate};
pub use model::{GroupPolicy, GroupRow, KeyRow, RecoveryEntry, UserRow};
pub use retry::{RetryExecutor, RetryPolicy};
pub use selection::Selection;
pub use session::{Session, SessionHandle};
pub use status::{KeyStatus, EXPIRY_MARGIN_SECS};
pub use store::KeyStore;
pub use transaction::{CapturedStatement, SqlParam, Transaction};
pub use update::{RecordBody, ReplayReport, UpdateFileKind, UpdateRecord};
