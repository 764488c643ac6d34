//! Hook consulted before every use of a file key.

use tokenkms_common::Result;
use tokenkms_crypto::Direction;

/// Decides whether a key may currently be used in a direction.
pub trait KeyGate {
    /// Ok if `key_id` may be used for `direction`, otherwise the error
    /// explaining why not.
    fn check(&self, key_id: u32, direction: Direction) -> Result<()>;
}

/// Gate that admits every key. Used where no key store is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl KeyGate for AlwaysValid {
    fn check(&self, _key_id: u32, _direction: Direction) -> Result<()> {
        Ok(())
    }
}

impl<G: KeyGate + ?Sized> KeyGate for &G {
    fn check(&self, key_id: u32, direction: Direction) -> Result<()> {
        (**self).check(key_id, direction)
    }
}
