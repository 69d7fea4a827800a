//! Front cache manager.
//!
//! Keeps recently used metadata records (and their decoded values) in a
//! bounded LRU in front of a [`CacheBacking`]. Every write is a
//! compare-and-put: against the backing by version, and against the LRU by
//! entry identity. A writer that loses either race gets
//! [`PutOutcome::Conflict`] and the front entry is dropped so the next access
//! reloads from the backing.

use crate::backing::CacheBacking;
use crate::codec::{BincodeSerializer, ValueCodec, ValueSerializer};
use crate::lru::LruCache;
use distcache_common::config::CacheConfig;
use distcache_common::{CachePolicy, Error, HashKey, Result};
use distcache_store::{MnodeEntry, MnodeValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Front cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from the LRU
    pub hits: AtomicU64,
    /// Lookups that went to the backing
    pub misses: AtomicU64,
    /// Writes that lost a version race
    pub conflicts: AtomicU64,
    /// Writes the backing refused
    pub store_failures: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Outcome of [`FileCacheManager::put`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry already holds this exact value
    Unchanged,
    /// Committed at `version`
    Stored { version: u64 },
    /// Another writer changed the entry first
    Conflict,
    /// The backing failed to persist the value
    StoreFailed,
}

/// One LRU slot: the metadata record (if any) and its lazily decoded value
pub struct FrontEntry<V> {
    mnode: Option<MnodeEntry>,
    value: OnceLock<Arc<V>>,
}

impl<V> FrontEntry<V> {
    fn new(mnode: Option<MnodeEntry>) -> Self {
        Self {
            mnode,
            value: OnceLock::new(),
        }
    }

    fn with_value(mnode: Option<MnodeEntry>, value: Arc<V>) -> Self {
        let entry = Self::new(mnode);
        let _ = entry.value.set(value);
        entry
    }

    pub fn mnode(&self) -> Option<&MnodeEntry> {
        self.mnode.as_ref()
    }

    /// Version the next write must be based on
    pub fn version(&self) -> u64 {
        self.mnode.as_ref().map_or(0, |m| m.version)
    }

    fn live(&self) -> Option<&MnodeEntry> {
        self.mnode.as_ref().filter(|m| !m.is_tombstone())
    }
}

/// LRU-fronted cache of typed values over a persistence backing
pub struct FileCacheManager<V, S = BincodeSerializer> {
    backing: Arc<dyn CacheBacking>,
    front: LruCache<HashKey, FrontEntry<V>>,
    codec: ValueCodec,
    serializer: S,
    default_policy: CachePolicy,
    stats: CacheStats,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> FileCacheManager<V, BincodeSerializer> {
    /// Manager storing values with bincode
    pub fn with_bincode(backing: Arc<dyn CacheBacking>, config: &CacheConfig) -> Self {
        Self::new(backing, config, BincodeSerializer)
    }
}

impl<V, S: ValueSerializer<V>> FileCacheManager<V, S> {
    pub fn new(backing: Arc<dyn CacheBacking>, config: &CacheConfig, serializer: S) -> Self {
        Self {
            backing,
            front: LruCache::new(config.front_capacity),
            codec: ValueCodec::new(config.compression_level),
            serializer,
            default_policy: config.default_policy(),
            stats: CacheStats::default(),
            _marker: PhantomData,
        }
    }

    pub fn backing(&self) -> &Arc<dyn CacheBacking> {
        &self.backing
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Policy applied by [`Self::put_default`]
    pub fn default_policy(&self) -> &CachePolicy {
        &self.default_policy
    }

    /// Number of entries held in the LRU
    pub fn front_len(&self) -> usize {
        self.front.len()
    }

    /// Drop the front entry so the next access reloads it
    pub fn invalidate(&self, key: &HashKey) {
        self.front.remove(key);
    }

    /// Front entry for `key`, loading it from the backing on a miss
    fn front_entry(&self, key: &HashKey) -> Arc<FrontEntry<V>> {
        if let Some(entry) = self.front.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return entry;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = Arc::new(FrontEntry::new(self.backing.load_local_entry(key)));
        self.front.put_if_new(*key, loaded)
    }

    /// Current value of `key`, or `None` if absent, removed or expired
    pub fn get(&self, key: &HashKey) -> Result<Option<Arc<V>>> {
        let mut entry = self.front_entry(key);
        let now = self.backing.now();
        let Some(mnode) = entry.live() else {
            return Ok(None);
        };
        if mnode.is_expired(now) {
            debug!("front entry {} expired", key.short());
            self.front.compare_and_remove(key, &entry);
            return Ok(None);
        }
        if mnode.needs_idle_refresh(now) {
            entry = self.refresh_idle(key, entry, now);
        }
        self.value_of(key, &entry).map(Some)
    }

    fn refresh_idle(&self, key: &HashKey, entry: Arc<FrontEntry<V>>, now: u64) -> Arc<FrontEntry<V>> {
        let Some(mnode) = entry.mnode() else {
            return entry;
        };
        if !self.backing.save_local_update_time(key, &mnode.value, now) {
            // The row moved on; serve what we have and reload next time
            self.front.compare_and_remove(key, &entry);
            return entry;
        }
        let refreshed = MnodeEntry {
            update_time: now,
            ..mnode.clone()
        };
        let replacement = Arc::new(match entry.value.get() {
            Some(value) => FrontEntry::with_value(Some(refreshed), Arc::clone(value)),
            None => FrontEntry::new(Some(refreshed)),
        });
        if self
            .front
            .compare_and_put(*key, Some(&entry), Arc::clone(&replacement))
        {
            replacement
        } else {
            entry
        }
    }

    fn value_of(&self, key: &HashKey, entry: &Arc<FrontEntry<V>>) -> Result<Arc<V>> {
        if let Some(value) = entry.value.get() {
            return Ok(Arc::clone(value));
        }
        let hash = entry
            .live()
            .and_then(|m| m.value_hash)
            .ok_or_else(|| Error::storage(format!("entry {} has no value", key.short())))?;
        let Some(compressed) = self.backing.load_data(&hash) else {
            warn!("value {} of entry {} is missing", hash.short(), key.short());
            self.front.compare_and_remove(key, entry);
            return Err(Error::storage(format!("missing value {hash}")));
        };
        let bytes = self.codec.decode(&compressed)?;
        let value = Arc::new(self.serializer.deserialize(&bytes)?);
        Ok(Arc::clone(entry.value.get_or_init(|| value)))
    }

    /// Store `value` under the default policy
    pub fn put_default(&self, key: &HashKey, value: V) -> Result<PutOutcome> {
        let policy = self.default_policy.clone();
        self.put(key, value, &policy)
    }

    /// Store `value`. Identical encoded values are not rewritten.
    pub fn put(&self, key: &HashKey, value: V, policy: &CachePolicy) -> Result<PutOutcome> {
        let serialized = self.serializer.serialize(&value)?;
        let encoded = self.codec.encode(&serialized)?;
        let entry = self.front_entry(key);

        let now = self.backing.now();
        let unchanged = entry.live().is_some_and(|m| {
            m.value_hash == Some(encoded.hash) && m.has_policy(policy) && !m.is_expired(now)
        });
        if unchanged {
            debug!("put {} unchanged", key.short());
            return Ok(PutOutcome::Unchanged);
        }

        if !self.backing.save_data(&encoded.hash, &encoded.compressed) {
            self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
            warn!("failed to store value of {}", key.short());
            return Ok(PutOutcome::StoreFailed);
        }

        let update = MnodeValue::with_policy(Some(encoded.hash), encoded.len(), entry.version(), policy);
        let value = Arc::new(value);
        Ok(self.commit(key, &entry, &update, Some(value)))
    }

    /// Write a tombstone over the entry. False if there was nothing to
    /// remove or another writer got there first.
    pub fn remove(&self, key: &HashKey) -> bool {
        let entry = self.front_entry(key);
        let Some(old) = entry.live() else {
            return false;
        };
        let tombstone = MnodeValue::tombstone(old.version, &old.value);
        matches!(self.commit(key, &entry, &tombstone, None), PutOutcome::Stored { .. })
    }

    fn commit(
        &self,
        key: &HashKey,
        entry: &Arc<FrontEntry<V>>,
        update: &MnodeValue,
        value: Option<Arc<V>>,
    ) -> PutOutcome {
        let Some(committed) = self.backing.put_local_value(key, update, entry.mnode()) else {
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            self.front.compare_and_remove(key, entry);
            return PutOutcome::Conflict;
        };

        let version = committed.version;
        let now = self.backing.now();
        let mnode = MnodeEntry {
            value: committed,
            update_time: now,
            access_time: now,
            server_version: self.backing.server_version(),
            same_generation: true,
        };
        let replacement = Arc::new(match value {
            Some(value) => FrontEntry::with_value(Some(mnode), value),
            None => FrontEntry::new(Some(mnode)),
        });
        if !self.front.compare_and_put(*key, Some(entry), replacement) {
            self.front.remove(key);
        }
        debug!("put {} committed v{}", key.short(), version);
        PutOutcome::Stored { version }
    }
}
