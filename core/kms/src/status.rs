//! Key status state machine.
//!
//! ```text
//! preactive  -> active | deactivated | compromised | destroyed
//! active     -> suspended | deactivated | compromised | destroyed
//! suspended  -> active | deactivated | compromised | destroyed
//! deactivated -> compromised | destroyed
//! compromised -> destroyed
//! destroyed  (sink)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use tokenkms_common::{Error, Result};

/// Seconds before expiration at which a key is already treated as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Lifecycle status of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Generated, not yet usable.
    PreActive,
    /// Usable for encryption and decryption.
    Active,
    /// Temporarily unusable for encryption.
    Suspended,
    /// Past its cryptoperiod; decryption only.
    Deactivated,
    /// Known to be exposed.
    Compromised,
    /// Material erased.
    Destroyed,
}

impl KeyStatus {
    /// All statuses.
    pub const ALL: [KeyStatus; 6] = [
        KeyStatus::PreActive,
        KeyStatus::Active,
        KeyStatus::Suspended,
        KeyStatus::Deactivated,
        KeyStatus::Compromised,
        KeyStatus::Destroyed,
    ];

    /// Code stored in the `keys.status` column.
    pub fn code(&self) -> i64 {
        match self {
            KeyStatus::PreActive => 0,
            KeyStatus::Active => 1,
            KeyStatus::Suspended => 2,
            KeyStatus::Deactivated => 3,
            KeyStatus::Compromised => 4,
            KeyStatus::Destroyed => 5,
        }
    }

    /// Resolve a stored status code.
    pub fn from_code(code: i64) -> Result<Self> {
        KeyStatus::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| Error::Storage(format!("Unknown key status code {}", code)))
    }

    /// Statuses reachable in one step.
    pub fn successors(&self) -> &'static [KeyStatus] {
        use KeyStatus::*;
        match self {
            PreActive => &[Active, Deactivated, Compromised, Destroyed],
            Active => &[Suspended, Deactivated, Compromised, Destroyed],
            Suspended => &[Active, Deactivated, Compromised, Destroyed],
            Deactivated => &[Compromised, Destroyed],
            Compromised => &[Destroyed],
            Destroyed => &[],
        }
    }

    /// Whether `self -> next` is allowed.
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Validate `self -> next`.
    ///
    /// # Errors
    /// - `Error::State` for any transition outside the table, including
    ///   self-transitions
    pub fn transition(&self, next: KeyStatus) -> Result<KeyStatus> {
        if !self.can_transition_to(next) {
            return Err(Error::State(format!(
                "Key status cannot change from {} to {}",
                self, next
            )));
        }
        Ok(next)
    }

    /// Name of the timestamp column stamped when entering this status.
    pub(crate) fn timestamp_column(&self) -> Option<&'static str> {
        match self {
            KeyStatus::PreActive | KeyStatus::Active => None,
            KeyStatus::Suspended => Some("suspended_at"),
            KeyStatus::Deactivated => Some("deactivated_at"),
            KeyStatus::Compromised => Some("compromised_at"),
            KeyStatus::Destroyed => Some("destroyed_at"),
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyStatus::PreActive => "preactive",
            KeyStatus::Active => "active",
            KeyStatus::Suspended => "suspended",
            KeyStatus::Deactivated => "deactivated",
            KeyStatus::Compromised => "compromised",
            KeyStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Activation and expiration after activating a key.
///
/// Only a key that was never activated (`activated_at == 0`) is stamped;
/// reactivating a suspended key keeps its original window.
pub fn activation_window(
    activated_at: i64,
    expires_at: i64,
    key_cryptoperiod: i64,
    group_cryptoperiod: i64,
    now: i64,
) -> (i64, i64) {
    if activated_at != 0 {
        return (activated_at, expires_at);
    }
    let period = if key_cryptoperiod != 0 {
        key_cryptoperiod
    } else {
        group_cryptoperiod
    };
    (now, now + period)
}

/// Whether an active or suspended key must already be treated as expired.
pub fn is_expiring(expires_at: i64, now: i64) -> bool {
    expires_at != 0 && expires_at <= now + EXPIRY_MARGIN_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(KeyStatus::PreActive.can_transition_to(KeyStatus::Active));
        assert!(KeyStatus::Suspended.can_transition_to(KeyStatus::Active));
        assert!(KeyStatus::Compromised.can_transition_to(KeyStatus::Destroyed));
        assert!(!KeyStatus::Deactivated.can_transition_to(KeyStatus::Active));
    }

    #[test]
    fn test_every_unlisted_pair_rejected() {
        let allowed = [
            (KeyStatus::PreActive, KeyStatus::Active),
            (KeyStatus::PreActive, KeyStatus::Deactivated),
            (KeyStatus::PreActive, KeyStatus::Compromised),
            (KeyStatus::PreActive, KeyStatus::Destroyed),
            (KeyStatus::Active, KeyStatus::Suspended),
            (KeyStatus::Active, KeyStatus::Deactivated),
            (KeyStatus::Active, KeyStatus::Compromised),
            (KeyStatus::Active, KeyStatus::Destroyed),
            (KeyStatus::Suspended, KeyStatus::Active),
            (KeyStatus::Suspended, KeyStatus::Deactivated),
            (KeyStatus::Suspended, KeyStatus::Compromised),
            (KeyStatus::Suspended, KeyStatus::Destroyed),
            (KeyStatus::Deactivated, KeyStatus::Compromised),
            (KeyStatus::Deactivated, KeyStatus::Destroyed),
            (KeyStatus::Compromised, KeyStatus::Destroyed),
        ];
        for from in KeyStatus::ALL {
            for to in KeyStatus::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(from.transition(to).is_ok(), expected, "{} -> {}", from, to);
            }
        }
        assert!(KeyStatus::Destroyed.successors().is_empty());
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in KeyStatus::ALL {
            assert_eq!(KeyStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(KeyStatus::from_code(9).is_err());
    }

    #[test]
    fn test_first_activation_stamps_window() {
        assert_eq!(activation_window(0, 0, 0, 3600, 1000), (1000, 4600));
        assert_eq!(activation_window(0, 0, 60, 3600, 1000), (1000, 1060));
        // reactivation after suspension keeps the original window
        assert_eq!(activation_window(1000, 4600, 0, 3600, 2000), (1000, 4600));
    }

    #[test]
    fn test_expiry_margin() {
        assert!(!is_expiring(0, 1000));
        assert!(is_expiring(1060, 1000));
        assert!(!is_expiring(1061, 1000));
    }

    proptest! {
        #[test]
        fn test_lifecycle_never_returns_to_preactive(steps in prop::collection::vec(0usize..6, 0..32)) {
            let mut status = KeyStatus::PreActive;
            for step in steps {
                let next = KeyStatus::ALL[step];
                if let Ok(moved) = status.transition(next) {
                    prop_assert_ne!(moved, KeyStatus::PreActive);
                    prop_assert_ne!(status, KeyStatus::Destroyed);
                    status = moved;
                }
            }
        }
    }
}
