//! Core type definitions for distcache
//!
//! Entry flags, timeout sentinels and the per-cache policy that metadata
//! records are stamped with.

use crate::clock::millis;
use crate::hash::HashKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout value meaning "never expires"
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Maximum number of rows returned by one change-feed page
pub const UPDATE_BATCH_SIZE: usize = 1024;

/// Entry is replicated to peers and appears in the global change feed
pub const FLAG_TRIPLICATE: u64 = 0x1;
/// Entry lives only in memory on the owning node
pub const FLAG_TRANSIENT: u64 = 0x2;
/// Misses are filled by a read-through loader above the core
pub const FLAG_READ_THROUGH: u64 = 0x4;

/// Settings of one logical cache namespace, copied into each record it writes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Namespace identity (hash of the cache name)
    pub cache_hash: Option<HashKey>,
    /// Entry flag bits
    pub flags: u64,
    /// Idle timeout in milliseconds
    pub access_timeout: u64,
    /// Absolute timeout in milliseconds
    pub modified_timeout: u64,
    /// Lease duration in milliseconds
    pub lease_timeout: u64,
}

impl CachePolicy {
    /// Policy for a named cache with no expiry
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            cache_hash: Some(HashKey::for_key(name)),
            ..Self::default()
        }
    }

    /// Set the idle timeout
    #[must_use]
    pub fn with_access_timeout(mut self, timeout: Duration) -> Self {
        self.access_timeout = millis(timeout);
        self
    }

    /// Set the absolute timeout
    #[must_use]
    pub fn with_modified_timeout(mut self, timeout: Duration) -> Self {
        self.modified_timeout = millis(timeout);
        self
    }

    /// Set the lease duration
    #[must_use]
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = millis(timeout);
        self
    }

    /// Add flag bits
    #[must_use]
    pub const fn with_flags(mut self, flags: u64) -> Self {
        self.flags |= flags;
        self
    }

    /// Whether entries of this cache are fed to replication peers
    #[must_use]
    pub const fn is_triplicate(&self) -> bool {
        self.flags & FLAG_TRIPLICATE != 0
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_hash: None,
            flags: 0,
            access_timeout: NO_TIMEOUT,
            modified_timeout: NO_TIMEOUT,
            lease_timeout: 0,
        }
    }
}

/// Idle window with the 5/4 grace multiplier, `None` for "never"
#[must_use]
pub fn idle_grace(access_timeout: u64) -> Option<u64> {
    if access_timeout == NO_TIMEOUT {
        None
    } else {
        Some(
            (access_timeout / 4)
                .saturating_mul(5)
                .saturating_add(access_timeout % 4 * 5 / 4),
        )
    }
}
