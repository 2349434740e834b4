//! 16-byte request and lock identifiers

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A 16-byte identifier used both for request correlation and as a lock id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident([u8; 16]);

impl Ident {
    /// The all-zero identifier.
    pub const ZERO: Ident = Ident([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub const fn into_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Builds an identifier from two little-endian `u64` halves.
    pub fn from_u64_pair(first: u64, second: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&first.to_le_bytes());
        bytes[8..].copy_from_slice(&second.to_le_bytes());
        Self(bytes)
    }

    /// Splits the identifier into two little-endian `u64` halves.
    pub fn to_u64_pair(&self) -> (u64, u64) {
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&self.0[..8]);
        second.copy_from_slice(&self.0[8..]);
        (u64::from_le_bytes(first), u64::from_le_bytes(second))
    }
}

impl From<[u8; 16]> for Ident {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({})", self)
    }
}

/// Generates identifiers unique within the owning client's lifetime.
///
/// Layout: 6 bytes of millisecond timestamp, 6 random bytes, then a 4-byte
/// counter with the top bit cleared, all big-endian.
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(rand::random::<u32>() & 0x7fff_ffff),
        }
    }

    pub fn next_id(&self) -> Ident {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let random = rand::random::<u64>();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;

        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..]);
        bytes[6..12].copy_from_slice(&random.to_be_bytes()[2..]);
        bytes[12..].copy_from_slice(&counter.to_be_bytes());
        Ident(bytes)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
