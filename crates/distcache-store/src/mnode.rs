//! Metadata record types
//!
//! [`MnodeValue`] is the single immutable record describing one cache entry:
//! which blob holds its value, its version, and the policy it was written
//! under. [`MnodeEntry`] is what a load returns: the value plus the
//! bookkeeping the store attaches (update time, server generation).

use distcache_common::types::{FLAG_TRIPLICATE, NO_TIMEOUT, idle_grace};
use distcache_common::{CachePolicy, HashKey};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Versioned metadata record of one cache entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MnodeValue {
    /// Content hash of the value blob; `None` is a tombstone
    pub value_hash: Option<HashKey>,
    /// Local bookkeeping offset of the value
    pub value_index: u64,
    /// Encoded length of the value in bytes
    pub value_length: u64,
    /// Entry version
    pub version: u64,
    /// Cache namespace the entry belongs to
    pub cache_hash: Option<HashKey>,
    /// Entry flag bits
    pub flags: u64,
    /// Idle timeout in milliseconds
    pub access_timeout: u64,
    /// Absolute timeout in milliseconds
    pub modified_timeout: u64,
    /// Lease duration in milliseconds
    pub lease_timeout: u64,
    /// Server index holding the lease, if any
    pub lease_owner: Option<u32>,
}

/// A requested change to an entry. Same shape as the stored record.
pub type MnodeUpdate = MnodeValue;

impl MnodeValue {
    /// Record with no expiry and no namespace
    #[must_use]
    pub fn new(value_hash: Option<HashKey>, value_length: u64, version: u64) -> Self {
        Self::with_policy(value_hash, value_length, version, &CachePolicy::default())
    }

    /// Record stamped with a cache's policy
    #[must_use]
    pub fn with_policy(
        value_hash: Option<HashKey>,
        value_length: u64,
        version: u64,
        policy: &CachePolicy,
    ) -> Self {
        Self {
            value_hash,
            value_index: 0,
            value_length,
            version,
            cache_hash: policy.cache_hash,
            flags: policy.flags,
            access_timeout: policy.access_timeout,
            modified_timeout: policy.modified_timeout,
            lease_timeout: policy.lease_timeout,
            lease_owner: None,
        }
    }

    /// Local record built from an update received from elsewhere
    #[must_use]
    pub fn from_update(update: &MnodeUpdate, value_index: u64) -> Self {
        Self {
            value_index,
            ..update.clone()
        }
    }

    /// Tombstone at `version`, keeping the namespace and policy of `old`
    #[must_use]
    pub fn tombstone(version: u64, old: &Self) -> Self {
        Self {
            value_hash: None,
            value_index: 0,
            value_length: 0,
            version,
            lease_owner: None,
            ..old.clone()
        }
    }

    #[must_use]
    pub fn with_lease(mut self, owner: u32, timeout: u64) -> Self {
        self.lease_owner = Some(owner);
        self.lease_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The same record one version later
    #[must_use]
    pub fn next_version(&self) -> Self {
        self.clone().with_version(self.version.saturating_add(1))
    }

    /// Copy suitable for shipping to a peer: no local offset, no lease holder
    #[must_use]
    pub fn for_remote(&self) -> Self {
        Self {
            value_index: 0,
            lease_owner: None,
            ..self.clone()
        }
    }

    /// Whether the record was written under exactly `policy`
    #[must_use]
    pub fn has_policy(&self, policy: &CachePolicy) -> bool {
        self.cache_hash == policy.cache_hash
            && self.flags == policy.flags
            && self.access_timeout == policy.access_timeout
            && self.modified_timeout == policy.modified_timeout
            && self.lease_timeout == policy.lease_timeout
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.value_hash.is_none()
    }

    #[must_use]
    pub const fn is_triplicate(&self) -> bool {
        self.flags & FLAG_TRIPLICATE != 0
    }

    /// Instant the record expires if last updated at `update_time`.
    ///
    /// Idle expiry is `update_time + 5/4 * access_timeout`, absolute expiry is
    /// `update_time + modified_timeout`; the earlier one wins.
    #[must_use]
    pub fn expire_time(&self, update_time: u64) -> Option<u64> {
        let idle = idle_grace(self.access_timeout).map(|t| update_time.saturating_add(t));
        let modified = (self.modified_timeout != NO_TIMEOUT)
            .then(|| update_time.saturating_add(self.modified_timeout));
        match (idle, modified) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Metadata record as loaded from the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MnodeEntry {
    pub value: MnodeValue,
    /// Last time the row was written or refreshed
    pub update_time: u64,
    /// Instant this entry was loaded
    pub access_time: u64,
    /// Store generation that last wrote the row
    pub server_version: u64,
    /// Row was written by the current store generation
    pub same_generation: bool,
}

impl Deref for MnodeEntry {
    type Target = MnodeValue;

    fn deref(&self) -> &MnodeValue {
        &self.value
    }
}

impl MnodeEntry {
    #[must_use]
    pub fn expire_time(&self) -> Option<u64> {
        self.value.expire_time(self.update_time)
    }

    /// Whether the entry has passed its expiration instant
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_time().is_some_and(|t| t < now)
    }

    /// A quarter of the idle window has elapsed since the last refresh
    #[must_use]
    pub fn needs_idle_refresh(&self, now: u64) -> bool {
        self.access_timeout != NO_TIMEOUT
            && self.update_time.saturating_add(self.access_timeout / 4) <= now
    }

    #[must_use]
    pub fn is_lease_expired(&self, now: u64) -> bool {
        match self.lease_owner {
            Some(_) => self.update_time.saturating_add(self.lease_timeout) <= now,
            None => true,
        }
    }

    #[must_use]
    pub fn is_leased_by(&self, owner: u32, now: u64) -> bool {
        self.lease_owner == Some(owner) && !self.is_lease_expired(now)
    }
}

/// One row of the replication change feed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheData {
    pub key: HashKey,
    pub value_hash: Option<HashKey>,
    pub value_index: u64,
    pub value_length: u64,
    pub version: u64,
    pub cache_hash: Option<HashKey>,
    pub flags: u64,
    pub update_time: u64,
    pub access_timeout: u64,
    pub modified_timeout: u64,
    /// Row is a removal marker
    pub removed: bool,
}

/// A metadata row selected by the expiration scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredMnode {
    pub key: HashKey,
    pub value_hash: Option<HashKey>,
    pub value_index: u64,
}
