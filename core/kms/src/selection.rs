//! Choosing the key two or more users should share.
//!
//! Candidate groups must contain every party and own at least one active key.
//! Only the candidates with the fewest members are kept; their active keys are
//! then ranked by algorithm strength, shortest validity window, most recent
//! activation and finally smallest id.

use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tokenkms_common::{Error, GroupId, Result, UserId};

use crate::model::{GroupRow, KeyRow};
use crate::status::KeyStatus;
use crate::store::KeyStore;

/// Outcome of a user-to-many selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// The best shared key.
    Found(KeyRow),
    /// The single destination shares no usable key with the sender.
    NoKeyForDestination,
    /// No group with a usable key contains the sender and every destination.
    NoCommonGroup,
}

impl Selection {
    /// The selected key, if any.
    pub fn key(&self) -> Option<&KeyRow> {
        match self {
            Selection::Found(key) => Some(key),
            _ => None,
        }
    }
}

/// Total order of candidate keys, best first.
pub fn rank(a: &KeyRow, b: &KeyRow) -> Ordering {
    let sort_key = |k: &KeyRow| {
        (
            Reverse(k.algorithm),
            k.validity_window(),
            Reverse(k.activated_at),
            k.id,
        )
    };
    sort_key(a).cmp(&sort_key(b))
}

fn active_keys(store: &KeyStore, group: GroupId) -> Result<Vec<KeyRow>> {
    Ok(store
        .group_keys(group)?
        .into_iter()
        .filter(|k| k.status == KeyStatus::Active)
        .collect())
}

fn best(mut keys: Vec<KeyRow>) -> Option<KeyRow> {
    keys.sort_by(rank);
    keys.into_iter().next()
}

/// Best key among the smallest groups shared by all `parties`.
fn shared_key(store: &KeyStore, parties: &[UserId]) -> Result<Option<KeyRow>> {
    let Some((first, rest)) = parties.split_first() else {
        return Ok(None);
    };

    let mut candidates: Vec<(GroupRow, Vec<KeyRow>)> = Vec::new();
    for group in store.user_groups(*first)? {
        let mut common = true;
        for user in rest {
            if !store.is_member(*user, group)? {
                common = false;
                break;
            }
        }
        if !common {
            continue;
        }
        let keys = active_keys(store, group)?;
        if !keys.is_empty() {
            candidates.push((store.get_group(group)?, keys));
        }
    }

    let Some(smallest) = candidates.iter().map(|(g, _)| g.user_count).min() else {
        return Ok(None);
    };
    let keys = candidates
        .into_iter()
        .filter(|(g, _)| g.user_count == smallest)
        .flat_map(|(_, keys)| keys)
        .collect();
    Ok(best(keys))
}

/// Key for `sender` to share with `receiver`.
pub fn find_key_v1(store: &KeyStore, sender: UserId, receiver: UserId) -> Result<Option<KeyRow>> {
    let key = shared_key(store, &[sender, receiver])?;
    debug!(%sender, %receiver, key = ?key.as_ref().map(|k| k.id), "User key selection");
    Ok(key)
}

/// Key for `sender` to share with every member of `group`.
///
/// Returns `None` when the sender is not a member of the group.
pub fn find_key_v2(store: &KeyStore, sender: UserId, group: GroupId) -> Result<Option<KeyRow>> {
    store.get_group(group)?;
    if !store.is_member(sender, group)? {
        return Ok(None);
    }
    Ok(best(active_keys(store, group)?))
}

/// Key for `sender` to share with all `receivers`.
///
/// # Errors
/// - `Error::Parameter` if `receivers` is empty
pub fn find_key_v3(store: &KeyStore, sender: UserId, receivers: &[UserId]) -> Result<Selection> {
    if receivers.is_empty() {
        return Err(Error::Parameter("At least one receiver is required".to_string()));
    }
    let mut parties = Vec::with_capacity(receivers.len() + 1);
    parties.push(sender);
    for receiver in receivers {
        if !parties.contains(receiver) {
            parties.push(*receiver);
        }
    }

    Ok(match shared_key(store, &parties)? {
        Some(key) => Selection::Found(key),
        None if receivers.len() == 1 => Selection::NoKeyForDestination,
        None => Selection::NoCommonGroup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sql_params;
    use crate::transaction::Transaction;
    use std::sync::Arc;
    use tokenkms_common::KeyId;
    use tokenkms_crypto::SoftToken;

    struct Fixture {
        store: KeyStore,
    }

    impl Fixture {
        fn new() -> Self {
            let token = Arc::new(SoftToken::new("SN-SEL", "1", "2"));
            Self {
                store: KeyStore::in_memory(token).unwrap(),
            }
        }

        fn users(&self, ids: &[u32]) {
            for id in ids {
                self.store
                    .conn()
                    .execute(
                        "INSERT INTO users (id, name, serial, k1, k2) VALUES (?1, ?2, ?2, 0, 0)",
                        rusqlite::params![id, format!("u{}", id)],
                    )
                    .unwrap();
            }
        }

        fn group(&self, id: u32, members: &[u32]) {
            let tx = Transaction::begin(self.store.conn(), &RetryPolicy::default()).unwrap();
            tx.execute_local(
                "INSERT INTO key_groups (id, name, max_keys, algorithm, cryptoperiod)
                 VALUES (?1, ?2, 16, 3, 3600)",
                sql_params![id, format!("g{}", id)],
            )
            .unwrap();
            for user in members {
                tx.execute_local(
                    "INSERT INTO user_groups (user_id, group_id) VALUES (?1, ?2)",
                    sql_params![*user, id],
                )
                .unwrap();
            }
            tx.commit().unwrap();
        }

        fn key(&self, id: u32, group: u32, status: KeyStatus, algorithm: u16, activated: i64, expires: i64) {
            self.store
                .conn()
                .execute(
                    "INSERT INTO keys (id, name, owner_group, status, algorithm, length, activated_at, expires_at)
                     VALUES (?1, 'k', ?2, ?3, ?4, 32, ?5, ?6)",
                    rusqlite::params![id, group, status.code(), algorithm, activated, expires],
                )
                .unwrap();
        }
    }

    fn uid(id: u32) -> UserId {
        UserId::new(id).unwrap()
    }

    fn selected(key: Option<KeyRow>) -> Option<u32> {
        key.map(|k| k.id.value())
    }

    #[test]
    fn test_smallest_shared_group_wins() {
        let f = Fixture::new();
        f.users(&[1, 2, 3]);
        f.group(10, &[1, 2, 3]);
        f.group(20, &[1, 2]);
        f.key(100, 10, KeyStatus::Active, 3, 1000, 2000);
        f.key(200, 20, KeyStatus::Active, 1, 1000, 9000);

        assert_eq!(selected(find_key_v1(&f.store, uid(1), uid(2)).unwrap()), Some(200));
        assert_eq!(selected(find_key_v1(&f.store, uid(1), uid(3)).unwrap()), Some(100));
    }

    #[test]
    fn test_groups_without_active_keys_are_ignored() {
        let f = Fixture::new();
        f.users(&[1, 2, 3]);
        f.group(10, &[1, 2, 3]);
        f.group(20, &[1, 2]);
        f.key(100, 10, KeyStatus::Active, 3, 1000, 2000);
        f.key(200, 20, KeyStatus::Suspended, 3, 1000, 2000);

        assert_eq!(selected(find_key_v1(&f.store, uid(1), uid(2)).unwrap()), Some(100));
    }

    #[test]
    fn test_ranking_order() {
        let f = Fixture::new();
        f.users(&[1, 2]);
        f.group(10, &[1, 2]);
        f.key(1, 10, KeyStatus::Active, 1, 1000, 1100);
        f.key(2, 10, KeyStatus::Active, 3, 1000, 5000);
        f.key(3, 10, KeyStatus::Active, 3, 1000, 3000);
        f.key(4, 10, KeyStatus::Active, 3, 2000, 4000);
        f.key(5, 10, KeyStatus::Active, 3, 2000, 4000);

        // strongest, then shortest window, then newest activation, then smallest id
        assert_eq!(selected(find_key_v1(&f.store, uid(1), uid(2)).unwrap()), Some(4));
        let mut keys = f.store.keys().unwrap();
        keys.sort_by(rank);
        let order: Vec<u32> = keys.iter().map(|k| k.id.value()).collect();
        assert_eq!(order, vec![4, 5, 3, 2, 1]);
    }

    #[test]
    fn test_group_selection_requires_membership() {
        let f = Fixture::new();
        f.users(&[1, 2]);
        f.group(10, &[2]);
        f.key(100, 10, KeyStatus::Active, 3, 1000, 2000);
        let group = GroupId::new(10).unwrap();

        assert_eq!(find_key_v2(&f.store, uid(1), group).unwrap(), None);
        assert_eq!(selected(find_key_v2(&f.store, uid(2), group).unwrap()), Some(100));
        assert!(matches!(
            find_key_v2(&f.store, uid(2), GroupId::new(99).unwrap()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_many_receivers_outcomes() {
        let f = Fixture::new();
        f.users(&[1, 2, 3, 4]);
        f.group(10, &[1, 2, 3]);
        f.key(100, 10, KeyStatus::Active, 3, 1000, 2000);

        let found = find_key_v3(&f.store, uid(1), &[uid(2), uid(3)]).unwrap();
        assert_eq!(found.key().map(|k| k.id), Some(KeyId::new(100).unwrap()));
        assert_eq!(
            find_key_v3(&f.store, uid(1), &[uid(4)]).unwrap(),
            Selection::NoKeyForDestination
        );
        assert_eq!(
            find_key_v3(&f.store, uid(1), &[uid(2), uid(4)]).unwrap(),
            Selection::NoCommonGroup
        );
        assert!(matches!(find_key_v3(&f.store, uid(1), &[]), Err(Error::Parameter(_))));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let f = Fixture::new();
        f.users(&[1, 2]);
        f.group(10, &[1, 2]);
        f.group(11, &[1, 2]);
        f.key(7, 11, KeyStatus::Active, 3, 1000, 2000);
        f.key(3, 10, KeyStatus::Active, 3, 1000, 2000);

        let first = find_key_v1(&f.store, uid(1), uid(2)).unwrap();
        for _ in 0..5 {
            assert_eq!(find_key_v1(&f.store, uid(1), uid(2)).unwrap(), first);
        }
        assert_eq!(selected(first), Some(3));
    }
}
