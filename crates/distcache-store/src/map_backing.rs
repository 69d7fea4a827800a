//! Legacy single-table metadata layout.
//!
//! One row per entry holding the value hash, an idle timeout and the last
//! access time. Removal and invalidation are soft: the row stays with
//! `removed` or `valid = false` set, and loads skip it until a later save
//! revives it. The change feed is ordered by access time.

use crate::backing::Backing;
use crate::error::StoreResult;
use crate::mnode::CacheData;
use crate::tables;
use distcache_common::HashKey;
use distcache_common::types::{NO_TIMEOUT, UPDATE_BATCH_SIZE, idle_grace};
use redb::{ReadableTable, ReadableTableMetadata};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MapRow {
    value_hash: Option<HashKey>,
    value_length: u64,
    version: u64,
    timeout: u64,
    access_time: u64,
    server_version: u64,
    removed: bool,
    valid: bool,
}

impl MapRow {
    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn is_live(&self) -> bool {
        self.valid && !self.removed
    }

    fn is_expired(&self, now: u64) -> bool {
        idle_grace(self.timeout).is_some_and(|t| self.access_time.saturating_add(t) < now)
    }
}

pub(crate) fn live_value_refs(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    now: u64,
) -> StoreResult<Vec<(HashKey, HashKey)>> {
    let mut refs = Vec::new();
    for entry in table.iter()? {
        let (key, bytes) = entry?;
        let row = MapRow::decode(bytes.value())?;
        if !row.is_live() || row.is_expired(now) {
            continue;
        }
        if let Some(value_hash) = row.value_hash {
            refs.push((HashKey::from_slice(key.value())?, value_hash));
        }
    }
    Ok(refs)
}

/// Entry loaded from the legacy table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMapEntry {
    pub value_hash: Option<HashKey>,
    pub value_length: u64,
    pub version: u64,
    /// Idle timeout in milliseconds
    pub timeout: u64,
    pub access_time: u64,
    pub same_generation: bool,
}

/// Legacy single-table metadata store
pub struct CacheMapBacking {
    backing: Backing,
    server_version: u64,
    startup_last_access_time: u64,
    batch_size: usize,
}

impl CacheMapBacking {
    pub fn open(backing: Backing) -> StoreResult<Self> {
        let (max_server_version, max_access_time) = backing.read(|txn| {
            let table = txn.open_table(tables::CACHE_MAP)?;
            let mut max_server_version = 0;
            let mut max_access_time = 0;
            for entry in table.iter()? {
                let (_, bytes) = entry?;
                let row = MapRow::decode(bytes.value())?;
                max_server_version = max_server_version.max(row.server_version);
                max_access_time = max_access_time.max(row.access_time);
            }
            Ok((max_server_version, max_access_time))
        })?;

        info!(
            "cache map opened: server version {}, last access {}",
            max_server_version + 1,
            max_access_time
        );
        Ok(Self {
            backing,
            server_version: max_server_version + 1,
            startup_last_access_time: max_access_time,
            batch_size: UPDATE_BATCH_SIZE,
        })
    }

    /// Override the change-feed page size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn server_version(&self) -> u64 {
        self.server_version
    }

    pub fn startup_last_access_time(&self) -> u64 {
        self.startup_last_access_time
    }

    fn get_row(&self, key: &HashKey) -> StoreResult<Option<MapRow>> {
        self.backing.read(|txn| {
            txn.open_table(tables::CACHE_MAP)?
                .get(key.as_bytes().as_slice())?
                .map(|guard| MapRow::decode(guard.value()))
                .transpose()
        })
    }

    /// Read-modify-write of one row inside a single transaction.
    ///
    /// `f` returns the replacement row, or `None` to leave the row alone.
    fn modify(
        &self,
        key: &HashKey,
        f: impl FnOnce(Option<MapRow>) -> Option<MapRow>,
    ) -> StoreResult<bool> {
        self.backing.write(|txn| {
            let mut table = txn.open_table(tables::CACHE_MAP)?;
            let old = table
                .get(key.as_bytes().as_slice())?
                .map(|guard| MapRow::decode(guard.value()))
                .transpose()?;
            let Some(row) = f(old) else {
                return Ok(false);
            };
            let bytes = bincode::serialize(&row)?;
            table.insert(key.as_bytes().as_slice(), bytes.as_slice())?;
            Ok(true)
        })
    }

    /// Load a valid, non-removed row
    pub fn load(&self, key: &HashKey) -> Option<CacheMapEntry> {
        match self.get_row(key) {
            Ok(Some(row)) if row.is_live() => Some(CacheMapEntry {
                value_hash: row.value_hash,
                value_length: row.value_length,
                version: row.version,
                timeout: row.timeout,
                access_time: row.access_time,
                same_generation: row.server_version == self.server_version,
            }),
            Ok(_) => None,
            Err(e) => {
                error!("Failed to load cache map entry {}: {}", key.short(), e);
                None
            }
        }
    }

    /// Create a row at `version`. False if any row, live or not, exists.
    pub fn insert(
        &self,
        key: &HashKey,
        value_hash: Option<HashKey>,
        value_length: u64,
        version: u64,
        timeout: u64,
    ) -> bool {
        let now = self.backing.now();
        let result = self.modify(key, |old| {
            old.is_none().then(|| MapRow {
                value_hash,
                value_length,
                version,
                timeout,
                access_time: now,
                server_version: self.server_version,
                removed: false,
                valid: true,
            })
        });
        result.unwrap_or_else(|e| {
            error!("Failed to insert cache map entry {}: {}", key.short(), e);
            false
        })
    }

    /// Replace the value when the stored version is at most `version`,
    /// storing `version + 1` and reviving a removed or invalid row
    pub fn update_save(
        &self,
        key: &HashKey,
        value_hash: Option<HashKey>,
        value_length: u64,
        version: u64,
        timeout: u64,
    ) -> bool {
        let now = self.backing.now();
        let result = self.modify(key, |old| {
            let old = old?;
            (old.version <= version).then(|| MapRow {
                value_hash,
                value_length,
                version: version.saturating_add(1),
                timeout,
                access_time: now,
                server_version: self.server_version,
                removed: false,
                valid: true,
            })
        });
        match result {
            Ok(saved) => {
                debug!("cache map update_save {} from v{}: {}", key.short(), version, saved);
                saved
            }
            Err(e) => {
                error!("Failed to update cache map entry {}: {}", key.short(), e);
                false
            }
        }
    }

    /// Record an access
    pub fn update_access_time(&self, key: &HashKey, access_time: u64) -> bool {
        let result = self.modify(key, |old| {
            old.map(|row| MapRow {
                access_time,
                ..row
            })
        });
        result.unwrap_or_else(|e| {
            error!("Failed to update access time of {}: {}", key.short(), e);
            false
        })
    }

    /// Soft delete
    pub fn remove(&self, key: &HashKey) -> bool {
        let result = self.modify(key, |old| {
            old.map(|row| MapRow {
                removed: true,
                ..row
            })
        });
        result.unwrap_or_else(|e| {
            error!("Failed to remove cache map entry {}: {}", key.short(), e);
            false
        })
    }

    /// Mark the row invalid unless it already holds `value_hash`
    pub fn invalidate(&self, key: &HashKey, value_hash: Option<HashKey>) -> bool {
        let result = self.modify(key, |old| {
            old.filter(|row| row.value_hash != value_hash)
                .map(|row| MapRow { valid: false, ..row })
        });
        result.unwrap_or_else(|e| {
            error!("Failed to invalidate cache map entry {}: {}", key.short(), e);
            false
        })
    }

    /// Stamp the current generation onto a row still holding `value_hash`
    pub fn refresh_server_version(&self, key: &HashKey, value_hash: Option<HashKey>) -> bool {
        let now = self.backing.now();
        let result = self.modify(key, |old| {
            old.filter(|row| row.value_hash == value_hash)
                .map(|row| MapRow {
                    access_time: now,
                    server_version: self.server_version,
                    ..row
                })
        });
        result.unwrap_or_else(|e| {
            error!("Failed to refresh server version of {}: {}", key.short(), e);
            false
        })
    }

    /// Rows accessed at or after `since`, ordered by `(access_time, key)`
    pub fn updates_since(&self, since: u64, offset: usize) -> Vec<CacheData> {
        let result = self.backing.read(|txn| {
            let table = txn.open_table(tables::CACHE_MAP)?;
            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (key, bytes) = entry?;
                let row = MapRow::decode(bytes.value())?;
                if row.access_time >= since {
                    rows.push((row.access_time, HashKey::from_slice(key.value())?, row));
                }
            }
            rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            Ok(rows
                .into_iter()
                .skip(offset)
                .take(self.batch_size)
                .map(|(_, key, row)| CacheData {
                    key,
                    value_hash: row.value_hash,
                    value_index: 0,
                    value_length: row.value_length,
                    version: row.version,
                    cache_hash: None,
                    flags: 0,
                    update_time: row.access_time,
                    access_timeout: row.timeout,
                    modified_timeout: NO_TIMEOUT,
                    removed: row.removed,
                })
                .collect())
        });
        result.unwrap_or_else(|e| {
            error!("Failed to read cache map updates since {}: {}", since, e);
            Vec::new()
        })
    }

    /// Hard-delete rows idle past `5/4` of their timeout
    pub fn remove_expired_data(&self) -> usize {
        let now = self.backing.now();
        let result = self.backing.write(|txn| {
            let mut table = txn.open_table(tables::CACHE_MAP)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, bytes) = entry?;
                if MapRow::decode(bytes.value())?.is_expired(now) {
                    expired.push(key.value().to_vec());
                }
            }
            for key in &expired {
                table.remove(key.as_slice())?;
            }
            Ok(expired.len())
        });
        match result {
            Ok(count) => {
                if count > 0 {
                    debug!("cache map expired {} rows", count);
                }
                count
            }
            Err(e) => {
                error!("Failed to remove expired cache map rows: {}", e);
                0
            }
        }
    }

    /// Number of rows, including soft-deleted ones
    pub fn count(&self) -> u64 {
        let result = self
            .backing
            .read(|txn| Ok(txn.open_table(tables::CACHE_MAP)?.len()?));
        result.unwrap_or_else(|e| {
            error!("Failed to count cache map rows: {}", e);
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::test_support::open_backing;
    use crate::data_store::{DataStore, OwnerTable};
    use std::time::Duration;

    fn h(s: &str) -> HashKey {
        HashKey::for_key(s)
    }

    #[test]
    fn test_insert_and_versioned_update() {
        let (_dir, backing, _clock) = open_backing(100);
        let map = CacheMapBacking::open(backing).unwrap();
        let k = h("k");

        assert!(map.insert(&k, Some(h("a")), 3, 1, NO_TIMEOUT));
        assert!(!map.insert(&k, Some(h("b")), 3, 1, NO_TIMEOUT));
        assert!(map.update_save(&k, Some(h("b")), 3, 1, NO_TIMEOUT));
        assert!(!map.update_save(&k, Some(h("c")), 3, 1, NO_TIMEOUT));

        let entry = map.load(&k).unwrap();
        assert_eq!(entry.value_hash, Some(h("b")));
        assert_eq!(entry.version, 2);
        assert!(entry.same_generation);
    }

    #[test]
    fn test_soft_remove_and_revive() {
        let (_dir, backing, _clock) = open_backing(100);
        let map = CacheMapBacking::open(backing).unwrap();
        let k = h("k");
        map.insert(&k, Some(h("a")), 1, 1, NO_TIMEOUT);

        assert!(map.remove(&k));
        assert!(map.load(&k).is_none());
        assert_eq!(map.count(), 1);
        // A removed row still blocks insert but accepts a versioned save
        assert!(!map.insert(&k, Some(h("b")), 1, 1, NO_TIMEOUT));
        assert!(map.update_save(&k, Some(h("b")), 1, 1, NO_TIMEOUT));
        assert_eq!(map.load(&k).unwrap().value_hash, Some(h("b")));
    }

    #[test]
    fn test_invalidate_only_on_different_value() {
        let (_dir, backing, _clock) = open_backing(100);
        let map = CacheMapBacking::open(backing).unwrap();
        let k = h("k");
        map.insert(&k, Some(h("a")), 1, 1, NO_TIMEOUT);

        assert!(!map.invalidate(&k, Some(h("a"))));
        assert!(map.load(&k).is_some());
        assert!(map.invalidate(&k, Some(h("z"))));
        assert!(map.load(&k).is_none());
    }

    #[test]
    fn test_expiry_by_access_time() {
        let (_dir, backing, clock) = open_backing(0);
        let map = CacheMapBacking::open(backing).unwrap();
        map.insert(&h("idle"), Some(h("a")), 1, 1, 4000);
        map.insert(&h("kept"), Some(h("b")), 1, 1, NO_TIMEOUT);

        clock.set(4000);
        assert!(map.update_access_time(&h("idle"), 4000));
        clock.set(9000);
        assert_eq!(map.remove_expired_data(), 0);
        clock.set(9001);
        assert_eq!(map.remove_expired_data(), 1);
        assert!(map.load(&h("idle")).is_none());
        assert!(map.load(&h("kept")).is_some());
    }

    #[test]
    fn test_updates_ordered_by_access_time() {
        let (_dir, backing, clock) = open_backing(10);
        let map = CacheMapBacking::open(backing).unwrap();
        map.insert(&h("a"), Some(h("va")), 1, 1, NO_TIMEOUT);
        clock.set(20);
        map.insert(&h("b"), Some(h("vb")), 1, 1, NO_TIMEOUT);
        map.remove(&h("b"));

        let feed = map.updates_since(15, 0);
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].key, h("b"));
        assert!(feed[0].removed);
        assert_eq!(map.updates_since(0, 1).len(), 1);
    }

    #[test]
    fn test_recovery_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.redb");
        let clock = distcache_common::ManualClock::new(50);
        let k = h("k");
        {
            let map = CacheMapBacking::open(Backing::open(&path, clock.clone()).unwrap()).unwrap();
            map.insert(&k, Some(h("a")), 1, 1, NO_TIMEOUT);
        }
        clock.set(80);
        let map = CacheMapBacking::open(Backing::open(&path, clock).unwrap()).unwrap();
        assert_eq!(map.server_version(), 2);
        assert_eq!(map.startup_last_access_time(), 50);
        assert!(!map.load(&k).unwrap().same_generation);

        assert!(!map.refresh_server_version(&k, Some(h("b"))));
        assert!(map.refresh_server_version(&k, Some(h("a"))));
        let entry = map.load(&k).unwrap();
        assert!(entry.same_generation);
        assert_eq!(entry.access_time, 80);
    }

    #[test]
    fn test_removed_rows_do_not_keep_blobs() {
        let (_dir, backing, clock) = open_backing(0);
        let map = CacheMapBacking::open(backing.clone()).unwrap();
        let data = DataStore::new(backing, OwnerTable::CacheMap);
        let live = HashKey::digest(b"live");
        let dead = HashKey::digest(b"dead");
        data.save(&live, b"live");
        data.save(&dead, b"dead");
        map.insert(&h("a"), Some(live), 4, 1, NO_TIMEOUT);
        map.insert(&h("b"), Some(dead), 4, 1, NO_TIMEOUT);
        map.remove(&h("b"));

        clock.advance(Duration::from_secs(16 * 60));
        let report = data.remove_expired_data();
        assert_eq!(report.extended, 1);
        assert_eq!(report.removed, 1);
        assert!(data.is_data_available(&live));
        assert!(!data.is_data_available(&dead));
    }
}
