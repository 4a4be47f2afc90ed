//! Content hashing.
use core::ops::Deref;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_LENGTH: usize = 32;

/// Sentinel for a missing parent.
pub const EMPTY_HASH: Hash = Hash([0u8; HASH_LENGTH]);

/// A SHA-256 digest identifying an event or block.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl core::fmt::Debug for Hash {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl Deref for Hash {
    type Target = [u8; HASH_LENGTH];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Hash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hash = [0u8; HASH_LENGTH];
        hash.clone_from_slice(bytes);
        Self(hash)
    }

    /// True for the missing-parent sentinel.
    pub fn is_empty(&self) -> bool {
        *self == EMPTY_HASH
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

pub struct Hasher {
    hasher: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn sum(self) -> Hash {
        Hash::from_bytes(&self.hasher.finalize())
    }

    /// One-shot digest.
    pub fn digest(bytes: &[u8]) -> Hash {
        let mut hasher = Self::new();
        hasher.write(bytes);
        hasher.sum()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = Hasher::digest(b"hello world");
        let b = Hasher::digest(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Hasher::digest(b"hello worlds"));
    }

    #[test]
    fn empty_sentinel() {
        assert!(EMPTY_HASH.is_empty());
        assert!(!Hasher::digest(b"x").is_empty());
    }
}
