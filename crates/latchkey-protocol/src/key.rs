//! Lock key normalization

use crate::Ident;
use std::fmt;

/// Normalizes arbitrary key bytes to exactly 16 bytes.
///
/// Keys of at most 16 bytes are right-aligned behind leading zeros. Longer
/// keys are replaced by their MD5 digest.
pub fn normalize_key(key: &[u8]) -> [u8; 16] {
    if key.len() > 16 {
        return md5::compute(key).0;
    }
    let mut normalized = [0u8; 16];
    normalized[16 - key.len()..].copy_from_slice(key);
    normalized
}

/// A normalized 16-byte lock key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey([u8; 16]);

impl LockKey {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(normalize_key(key.as_ref()))
    }

    pub const fn from_normalized(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reinterprets the key as a lock id, as tree locks do for their marks.
    pub const fn as_ident(&self) -> Ident {
        Ident::from_bytes(self.0)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<&[u8]> for LockKey {
    fn from(key: &[u8]) -> Self {
        Self::new(key)
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockKey({})", self.as_ident())
    }
}
