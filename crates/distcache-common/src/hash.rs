//! Content hash keys
//!
//! A [`HashKey`] is a SHA-256 digest. It names both a cache entry (digest of
//! the user key) and a value blob (digest of the encoded value bytes).

use crate::error::{Error, Result};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a hash key in bytes
pub const HASH_LEN: usize = 32;

/// Fixed-width content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct HashKey([u8; HASH_LEN]);

impl HashKey {
    /// Wrap raw digest bytes
    #[must_use]
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of `data`
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash of a user-visible cache key
    #[must_use]
    pub fn for_key(key: &str) -> Self {
        Self::digest(key.as_bytes())
    }

    /// Build from a slice, rejecting anything that is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().map_err(|_| Error::InvalidHashKey {
            expected: HASH_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex of the full digest
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl AsRef<[u8]> for HashKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for HashKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidHashEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", self.short())
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
