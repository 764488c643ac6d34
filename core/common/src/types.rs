//! Common types used throughout the KMS.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// Highest token key id managed by the KMS. Ids above are provisioned manually
/// or reserved for synchronization keys.
pub const KMS_KEY_ID_MAX: u32 = 0x7FFF_FFFF;

/// First token key id used for per-user synchronization keys.
pub const SYNC_KEY_ID_BASE: u32 = 0x8000_0000;

/// Whether a token key id belongs to the KMS-managed range.
pub fn is_kms_key_id(id: u32) -> bool {
    (1..=KMS_KEY_ID_MAX).contains(&id)
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            /// Textual prefix of this id kind.
            pub const PREFIX: char = $prefix;

            /// Create an id from its numeric value.
            ///
            /// # Errors
            /// - Returns error if `value` is zero
            pub fn new(value: u32) -> crate::Result<Self> {
                if value == 0 {
                    return Err(crate::Error::Parameter(format!(
                        "{} id cannot be zero",
                        $prefix
                    )));
                }
                Ok(Self(value))
            }

            /// Get the numeric value.
            pub fn value(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                let digits = s.strip_prefix($prefix).ok_or_else(|| {
                    crate::Error::Parameter(format!("Malformed id '{}': expected prefix '{}'", s, $prefix))
                })?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(crate::Error::Parameter(format!("Malformed id '{}'", s)));
                }
                let value = digits
                    .parse::<u32>()
                    .map_err(|_| crate::Error::Parameter(format!("Id out of range: '{}'", s)))?;
                Self::new(value)
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a KMS user (`U<n>`).
    UserId,
    'U'
);

prefixed_id!(
    /// Identifier of a KMS group (`G<n>`).
    GroupId,
    'G'
);

prefixed_id!(
    /// Identifier of a KMS key (`K<n>`). The numeric value is the token key id.
    KeyId,
    'K'
);

impl KeyId {
    /// Create a key id, enforcing the KMS-managed range.
    pub fn managed(value: u32) -> crate::Result<Self> {
        if !is_kms_key_id(value) {
            return Err(crate::Error::Parameter(format!(
                "Key id {} is outside the KMS-managed range",
                value
            )));
        }
        Ok(Self(value))
    }
}

impl UserId {
    /// Token key id of this user's transport key (k1).
    pub fn transport_key_id(&self) -> u32 {
        SYNC_KEY_ID_BASE.wrapping_add(self.0.wrapping_mul(2))
    }

    /// Token key id of this user's key-wrapping key (k2).
    pub fn wrapping_key_id(&self) -> u32 {
        self.transport_key_id().wrapping_add(1)
    }
}

/// Current time as unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sensitive data wrapper that zeroizes on drop.
///
/// Serializes as a plain byte sequence; `Debug` only shows the length.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[serde(transparent)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ids() {
        assert_eq!("U1".parse::<UserId>().unwrap().value(), 1);
        assert_eq!("G20".parse::<GroupId>().unwrap().to_string(), "G20");
        assert_eq!("K1005".parse::<KeyId>().unwrap().value(), 1005);
    }

    #[test]
    fn test_malformed_ids_rejected() {
        assert!("1".parse::<UserId>().is_err());
        assert!("G1".parse::<UserId>().is_err());
        assert!("U".parse::<UserId>().is_err());
        assert!("U-3".parse::<UserId>().is_err());
        assert!("U0".parse::<UserId>().is_err());
        assert!("U99999999999".parse::<UserId>().is_err());
    }

    #[test]
    fn test_sync_key_ids_outside_kms_range() {
        let user = UserId::new(7).unwrap();
        assert_eq!(user.wrapping_key_id(), user.transport_key_id() + 1);
        assert!(!is_kms_key_id(user.transport_key_id()));
        assert!(!is_kms_key_id(user.wrapping_key_id()));
        assert!(KeyId::managed(SYNC_KEY_ID_BASE).is_err());
    }

    #[test]
    fn test_sensitive_bytes_debug_redacted() {
        let secret = SensitiveBytes::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", secret), "SensitiveBytes([REDACTED; 3 bytes])");
    }

    #[test]
    fn test_sensitive_bytes_serialize_as_plain_bytes() {
        let secret = SensitiveBytes::new(vec![7, 8]);
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "[7,8]");
        let back: SensitiveBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, secret);
        assert_eq!(back.as_bytes(), &[7, 8]);
    }

    proptest! {
        #[test]
        fn prop_key_id_display_parses_back(value in 1u32..) {
            let id = KeyId::new(value).unwrap();
            prop_assert_eq!(id.to_string().parse::<KeyId>().unwrap(), id);
        }
    }
}
