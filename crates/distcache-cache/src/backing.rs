//! Persistence façade over the metadata and blob stores.
//!
//! [`CacheBacking`] is what the front cache talks to. Two layouts implement
//! it: [`CacheDataBacking`] (versioned metadata table plus blob table) and
//! [`CacheMapDataBacking`] (the legacy single table plus blob table).
//!
//! Version convention: `update.version` passed to
//! [`CacheBacking::put_local_value`] is the version the caller read (0 when
//! the entry was absent). A successful put always commits at `version + 1`.

use bytes::Bytes;
use distcache_common::HashKey;
use distcache_common::config::StoreConfig;
use distcache_common::types::NO_TIMEOUT;
use distcache_store::{
    Backing, CacheData, CacheMapBacking, CacheMapEntry, DataStore, MnodeEntry, MnodeStore,
    MnodeUpdate, MnodeValue, OrphanListener, OwnerTable, StoreResult, SweepReport,
};
use std::sync::Arc;
use tracing::debug;

/// Result of one full expiration pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpireSummary {
    /// Metadata rows deleted
    pub entries: usize,
    /// Blob sweep outcome
    pub data: SweepReport,
}

/// Row counts and generation of a backing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackingStats {
    pub entries: u64,
    pub blobs: u64,
    pub server_version: u64,
}

/// Persistence contract used by the front cache
pub trait CacheBacking: Send + Sync {
    /// Current time of the backing's clock
    fn now(&self) -> u64;

    fn load_local_entry(&self, key: &HashKey) -> Option<MnodeEntry>;

    /// Write `update` over `old`; returns the committed record, or `None`
    /// when another writer got there first
    fn put_local_value(
        &self,
        key: &HashKey,
        update: &MnodeUpdate,
        old: Option<&MnodeEntry>,
    ) -> Option<MnodeValue>;

    /// Refresh the idle clock of `value` without changing its version
    fn save_local_update_time(&self, key: &HashKey, value: &MnodeValue, update_time: u64) -> bool;

    fn load_data(&self, value_hash: &HashKey) -> Option<Bytes>;

    fn save_data(&self, value_hash: &HashKey, data: &[u8]) -> bool;

    fn is_data_available(&self, value_hash: &HashKey) -> bool;

    fn startup_last_update_time(&self) -> u64;

    /// Generation stamped on rows written by this process
    fn server_version(&self) -> u64;

    /// Change feed of one cache namespace
    fn updates(&self, cache: &HashKey, since: u64, offset: usize) -> Vec<CacheData>;

    /// Change feed of replicated entries
    fn global_updates(&self, since: u64, offset: usize) -> Vec<CacheData>;

    /// Expire metadata, then blobs
    fn remove_expired_data(&self) -> ExpireSummary;

    fn add_orphan_listener(&self, listener: Arc<dyn OrphanListener>);

    fn stats(&self) -> BackingStats;
}

/// Split-layout façade: [`MnodeStore`] plus [`DataStore`]
pub struct CacheDataBacking {
    backing: Backing,
    mnodes: Arc<MnodeStore>,
    data: Arc<DataStore>,
}

impl CacheDataBacking {
    pub fn open(backing: Backing, config: &StoreConfig) -> StoreResult<Self> {
        let mnodes = MnodeStore::open(backing.clone())?.with_batch_size(config.update_batch_size);
        let data = DataStore::new(backing.clone(), OwnerTable::Mnode)
            .with_expire_timeout(config.data_expire_timeout);
        Ok(Self {
            backing,
            mnodes: Arc::new(mnodes),
            data: Arc::new(data),
        })
    }

    pub fn mnode_store(&self) -> &Arc<MnodeStore> {
        &self.mnodes
    }

    pub fn data_store(&self) -> &Arc<DataStore> {
        &self.data
    }
}

impl CacheBacking for CacheDataBacking {
    fn now(&self) -> u64 {
        self.backing.now()
    }

    fn load_local_entry(&self, key: &HashKey) -> Option<MnodeEntry> {
        self.mnodes.load(key)
    }

    fn put_local_value(
        &self,
        key: &HashKey,
        update: &MnodeUpdate,
        old: Option<&MnodeEntry>,
    ) -> Option<MnodeValue> {
        let committed = update.next_version();
        let saved = match old {
            None => self.mnodes.insert(key, &committed),
            Some(_) => {
                self.mnodes.update_save(key, update)
                    || (self.mnodes.load(key).is_none() && self.mnodes.insert(key, &committed))
            }
        };
        if saved {
            Some(committed)
        } else {
            debug!("put {} at v{} lost a version race", key.short(), update.version);
            None
        }
    }

    fn save_local_update_time(&self, key: &HashKey, value: &MnodeValue, update_time: u64) -> bool {
        self.mnodes
            .update_update_time(key, value.version, value.access_timeout, update_time)
    }

    fn load_data(&self, value_hash: &HashKey) -> Option<Bytes> {
        self.data.load_bytes(value_hash)
    }

    fn save_data(&self, value_hash: &HashKey, data: &[u8]) -> bool {
        self.data.save(value_hash, data)
    }

    fn is_data_available(&self, value_hash: &HashKey) -> bool {
        self.data.is_data_available(value_hash)
    }

    fn startup_last_update_time(&self) -> u64 {
        self.mnodes.startup_last_update_time()
    }

    fn server_version(&self) -> u64 {
        self.mnodes.server_version()
    }

    fn updates(&self, cache: &HashKey, since: u64, offset: usize) -> Vec<CacheData> {
        self.mnodes.cache_updates_since(cache, since, offset)
    }

    fn global_updates(&self, since: u64, offset: usize) -> Vec<CacheData> {
        self.mnodes.updates_since(since, offset)
    }

    fn remove_expired_data(&self) -> ExpireSummary {
        let entries = self.mnodes.remove_expired_data();
        let data = self.data.remove_expired_data();
        ExpireSummary { entries, data }
    }

    fn add_orphan_listener(&self, listener: Arc<dyn OrphanListener>) {
        self.data.add_orphan_listener(listener);
    }

    fn stats(&self) -> BackingStats {
        BackingStats {
            entries: self.mnodes.count(),
            blobs: self.data.count(),
            server_version: CacheBacking::server_version(self),
        }
    }
}

/// Legacy-layout façade: [`CacheMapBacking`] plus [`DataStore`].
///
/// The legacy table has no namespace, flags or absolute timeout; those
/// fields read back as their defaults.
pub struct CacheMapDataBacking {
    backing: Backing,
    map: Arc<CacheMapBacking>,
    data: Arc<DataStore>,
}

impl CacheMapDataBacking {
    pub fn open(backing: Backing, config: &StoreConfig) -> StoreResult<Self> {
        let map = CacheMapBacking::open(backing.clone())?.with_batch_size(config.update_batch_size);
        let data = DataStore::new(backing.clone(), OwnerTable::CacheMap)
            .with_expire_timeout(config.data_expire_timeout);
        Ok(Self {
            backing,
            map: Arc::new(map),
            data: Arc::new(data),
        })
    }

    pub fn map_backing(&self) -> &Arc<CacheMapBacking> {
        &self.map
    }

    pub fn data_store(&self) -> &Arc<DataStore> {
        &self.data
    }

    fn entry(&self, map_entry: CacheMapEntry) -> MnodeEntry {
        let value = MnodeValue {
            access_timeout: map_entry.timeout,
            modified_timeout: NO_TIMEOUT,
            ..MnodeValue::new(map_entry.value_hash, map_entry.value_length, map_entry.version)
        };
        MnodeEntry {
            value,
            update_time: map_entry.access_time,
            access_time: self.backing.now(),
            server_version: if map_entry.same_generation {
                self.map.server_version()
            } else {
                0
            },
            same_generation: map_entry.same_generation,
        }
    }
}

impl CacheBacking for CacheMapDataBacking {
    fn now(&self) -> u64 {
        self.backing.now()
    }

    fn load_local_entry(&self, key: &HashKey) -> Option<MnodeEntry> {
        self.map.load(key).map(|e| self.entry(e))
    }

    fn put_local_value(
        &self,
        key: &HashKey,
        update: &MnodeUpdate,
        old: Option<&MnodeEntry>,
    ) -> Option<MnodeValue> {
        let committed = update.next_version();
        let insert = || {
            self.map.insert(
                key,
                committed.value_hash,
                committed.value_length,
                committed.version,
                committed.access_timeout,
            )
        };
        let update_save = || {
            self.map.update_save(
                key,
                update.value_hash,
                update.value_length,
                update.version,
                update.access_timeout,
            )
        };
        // A soft-deleted row hides from loads but still occupies the key
        let saved = match old {
            None => insert() || update_save(),
            Some(_) => update_save() || insert(),
        };
        saved.then_some(committed)
    }

    fn save_local_update_time(&self, key: &HashKey, _value: &MnodeValue, update_time: u64) -> bool {
        self.map.update_access_time(key, update_time)
    }

    fn load_data(&self, value_hash: &HashKey) -> Option<Bytes> {
        self.data.load_bytes(value_hash)
    }

    fn save_data(&self, value_hash: &HashKey, data: &[u8]) -> bool {
        self.data.save(value_hash, data)
    }

    fn is_data_available(&self, value_hash: &HashKey) -> bool {
        self.data.is_data_available(value_hash)
    }

    fn startup_last_update_time(&self) -> u64 {
        self.map.startup_last_access_time()
    }

    fn server_version(&self) -> u64 {
        self.map.server_version()
    }

    /// The legacy table carries no namespace, so every row is in scope
    fn updates(&self, _cache: &HashKey, since: u64, offset: usize) -> Vec<CacheData> {
        self.map.updates_since(since, offset)
    }

    fn global_updates(&self, since: u64, offset: usize) -> Vec<CacheData> {
        self.map.updates_since(since, offset)
    }

    fn remove_expired_data(&self) -> ExpireSummary {
        let entries = self.map.remove_expired_data();
        let data = self.data.remove_expired_data();
        ExpireSummary { entries, data }
    }

    fn add_orphan_listener(&self, listener: Arc<dyn OrphanListener>) {
        self.data.add_orphan_listener(listener);
    }

    fn stats(&self) -> BackingStats {
        BackingStats {
            entries: self.map.count(),
            blobs: self.data.count(),
            server_version: CacheBacking::server_version(self),
        }
    }
}
