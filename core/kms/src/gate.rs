//! Key validity gate backed by the key store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use tokenkms_codec::KeyGate;
use tokenkms_common::{is_kms_key_id, now_ts, Error, KeyId, Result};
use tokenkms_crypto::Direction;

use crate::status::{is_expiring, KeyStatus};
use crate::store::KeyStore;

/// Last successful checks per key and direction.
pub struct GateCache {
    ttl: Duration,
    entries: RefCell<HashMap<(u32, Direction), Instant>>,
}

impl GateCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Forget every cached result.
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    fn is_fresh(&self, key_id: u32, direction: Direction) -> bool {
        self.entries
            .borrow()
            .get(&(key_id, direction))
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    fn record(&self, key_id: u32, direction: Direction) {
        self.entries
            .borrow_mut()
            .insert((key_id, direction), Instant::now());
    }
}

/// Status a key effectively has at `now`.
///
/// An active key inside the expiry margin is already deactivated.
pub fn effective_status(status: KeyStatus, expires_at: i64, now: i64) -> KeyStatus {
    if status == KeyStatus::Active && is_expiring(expires_at, now) {
        KeyStatus::Deactivated
    } else {
        status
    }
}

/// Whether a key in `status` may be used for `direction`.
///
/// # Errors
/// - `Error::State` describing why the key is unusable
pub fn permits(key_id: u32, status: KeyStatus, direction: Direction) -> Result<()> {
    match (status, direction) {
        (KeyStatus::Active, _) => Ok(()),
        (KeyStatus::Suspended | KeyStatus::Deactivated, Direction::Decrypt) => Ok(()),
        (status, direction) => Err(Error::State(format!(
            "Key {} is {} and cannot be used to {}",
            key_id,
            status,
            match direction {
                Direction::Encrypt => "encrypt",
                Direction::Decrypt => "decrypt",
            }
        ))),
    }
}

/// Gate consulting the key store, with a short-lived cache.
pub struct ValidityGate<'s> {
    store: &'s KeyStore,
    cache: &'s GateCache,
}

impl<'s> ValidityGate<'s> {
    /// Create a gate over `store` sharing `cache`.
    pub fn new(store: &'s KeyStore, cache: &'s GateCache) -> Self {
        Self { store, cache }
    }
}

impl KeyGate for ValidityGate<'_> {
    fn check(&self, key_id: u32, direction: Direction) -> Result<()> {
        if !is_kms_key_id(key_id) || self.cache.is_fresh(key_id, direction) {
            return Ok(());
        }

        let row = self
            .store
            .find_key(KeyId::new(key_id)?)?
            .ok_or_else(|| Error::State(format!("Key {} is unknown", key_id)))?;
        let status = effective_status(row.status, row.expires_at, now_ts());
        permits(key_id, status, direction)?;

        debug!(key_id, ?direction, "Key validity refreshed");
        self.cache.record(key_id, direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sql_params;
    use crate::transaction::Transaction;
    use std::sync::Arc;
    use tokenkms_crypto::SoftToken;

    fn store_with_key(status: KeyStatus, expires_at: i64) -> KeyStore {
        let store = KeyStore::in_memory(Arc::new(SoftToken::new("SN-G", "1", "2"))).unwrap();
        let tx = Transaction::begin(store.conn(), &RetryPolicy::default()).unwrap();
        tx.execute_local(
            "INSERT INTO keys (id, name, owner_group, status, algorithm, length, expires_at)
             VALUES (7, 'k', NULL, ?1, 3, 32, ?2)",
            sql_params![status.code(), expires_at],
        )
        .unwrap();
        tx.commit().unwrap();
        store
    }

    fn set_status(store: &KeyStore, status: KeyStatus) {
        store
            .conn()
            .execute("UPDATE keys SET status = ?1 WHERE id = 7", [status.code()])
            .unwrap();
    }

    #[test]
    fn test_status_mapping() {
        use Direction::*;
        for (status, encrypt, decrypt) in [
            (KeyStatus::Active, true, true),
            (KeyStatus::Suspended, false, true),
            (KeyStatus::Deactivated, false, true),
            (KeyStatus::Compromised, false, false),
            (KeyStatus::Destroyed, false, false),
            (KeyStatus::PreActive, false, false),
        ] {
            assert_eq!(permits(7, status, Encrypt).is_ok(), encrypt, "{}", status);
            assert_eq!(permits(7, status, Decrypt).is_ok(), decrypt, "{}", status);
        }
    }

    #[test]
    fn test_unknown_key_rejected_manual_key_admitted() {
        let store = store_with_key(KeyStatus::Active, 0);
        let cache = GateCache::new(Duration::from_secs(5));
        let gate = ValidityGate::new(&store, &cache);
        assert!(gate.check(8, Direction::Decrypt).is_err());
        assert!(gate.check(0x8000_0002, Direction::Encrypt).is_ok());
    }

    #[test]
    fn test_expiring_key_is_decrypt_only() {
        let store = store_with_key(KeyStatus::Active, now_ts() + 30);
        let cache = GateCache::new(Duration::from_secs(5));
        let gate = ValidityGate::new(&store, &cache);
        assert!(gate.check(7, Direction::Encrypt).is_err());
        assert!(gate.check(7, Direction::Decrypt).is_ok());
    }

    #[test]
    fn test_cache_until_cleared() {
        let store = store_with_key(KeyStatus::Active, 0);
        let cache = GateCache::new(Duration::from_secs(60));
        let gate = ValidityGate::new(&store, &cache);
        gate.check(7, Direction::Encrypt).unwrap();

        set_status(&store, KeyStatus::Compromised);
        assert!(gate.check(7, Direction::Encrypt).is_ok());
        // a direction never checked is not cached
        assert!(gate.check(7, Direction::Decrypt).is_err());

        cache.clear();
        assert!(gate.check(7, Direction::Encrypt).is_err());
    }

    #[test]
    fn test_zero_ttl_never_caches() {
        let store = store_with_key(KeyStatus::Active, 0);
        let cache = GateCache::new(Duration::ZERO);
        let gate = ValidityGate::new(&store, &cache);
        gate.check(7, Direction::Encrypt).unwrap();
        set_status(&store, KeyStatus::Destroyed);
        assert!(gate.check(7, Direction::Encrypt).is_err());
    }
}
