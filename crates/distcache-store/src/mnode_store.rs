//! Versioned metadata store and replication change feed.
//!
//! Rows live in [`tables::MNODE`] keyed by entry hash. Every write also
//! maintains [`tables::MNODE_BY_UPDATE_TIME`], ordered by `(update_time, key)`,
//! so the change feed is a range scan from the caller's cursor.
//!
//! Public methods never return store errors: failures are logged and reported
//! as a miss (`None`) or a failed write (`false`).

use crate::backing::Backing;
use crate::error::StoreResult;
use crate::mnode::{CacheData, ExpiredMnode, MnodeEntry, MnodeUpdate, MnodeValue};
use crate::tables::{self, split_time_key, time_key};
use distcache_common::HashKey;
use distcache_common::types::UPDATE_BATCH_SIZE;
use redb::{ReadableTable, ReadableTableMetadata, Table, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Persisted form of a metadata row
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MnodeRow {
    value_hash: Option<HashKey>,
    value_index: u64,
    value_length: u64,
    version: u64,
    cache_hash: Option<HashKey>,
    flags: u64,
    access_timeout: u64,
    modified_timeout: u64,
    lease_timeout: u64,
    server_version: u64,
    update_time: u64,
}

impl MnodeRow {
    fn new(update: &MnodeUpdate, version: u64, server_version: u64, update_time: u64) -> Self {
        Self {
            value_hash: update.value_hash,
            value_index: update.value_index,
            value_length: update.value_length,
            version,
            cache_hash: update.cache_hash,
            flags: update.flags,
            access_timeout: update.access_timeout,
            modified_timeout: update.modified_timeout,
            lease_timeout: update.lease_timeout,
            server_version,
            update_time,
        }
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn value(&self) -> MnodeValue {
        MnodeValue {
            value_hash: self.value_hash,
            value_index: self.value_index,
            value_length: self.value_length,
            version: self.version,
            cache_hash: self.cache_hash,
            flags: self.flags,
            access_timeout: self.access_timeout,
            modified_timeout: self.modified_timeout,
            lease_timeout: self.lease_timeout,
            lease_owner: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.value().expire_time(self.update_time).is_some_and(|t| t < now)
    }

    fn cache_data(&self, key: HashKey) -> CacheData {
        CacheData {
            key,
            value_hash: self.value_hash,
            value_index: self.value_index,
            value_length: self.value_length,
            version: self.version,
            cache_hash: self.cache_hash,
            flags: self.flags,
            update_time: self.update_time,
            access_timeout: self.access_timeout,
            modified_timeout: self.modified_timeout,
            removed: self.value_hash.is_none(),
        }
    }
}

/// Live value references held by the metadata table: `(entry key, value hash)`
/// for every unexpired row that points at a blob
pub(crate) fn live_value_refs(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    now: u64,
) -> StoreResult<Vec<(HashKey, HashKey)>> {
    let mut refs = Vec::new();
    for entry in table.iter()? {
        let (key, bytes) = entry?;
        let row = MnodeRow::decode(bytes.value())?;
        if row.is_expired(now) {
            continue;
        }
        if let Some(value_hash) = row.value_hash {
            refs.push((HashKey::from_slice(key.value())?, value_hash));
        }
    }
    Ok(refs)
}

/// Write `row` under `key`, moving its update-time index entry
fn put_row(
    txn: &WriteTransaction,
    key: &HashKey,
    old_update_time: Option<u64>,
    row: &MnodeRow,
) -> StoreResult<()> {
    let bytes = row.encode()?;
    let mut index = txn.open_table(tables::MNODE_BY_UPDATE_TIME)?;
    if let Some(old) = old_update_time {
        index.remove(time_key(old, key).as_slice())?;
    }
    index.insert(time_key(row.update_time, key).as_slice(), ())?;
    txn.open_table(tables::MNODE)?
        .insert(key.as_bytes().as_slice(), bytes.as_slice())?;
    Ok(())
}

fn get_row(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &HashKey,
) -> StoreResult<Option<MnodeRow>> {
    table
        .get(key.as_bytes().as_slice())?
        .map(|guard| MnodeRow::decode(guard.value()))
        .transpose()
}

fn delete_row(
    mnodes: &mut Table<'_, &'static [u8], &'static [u8]>,
    index: &mut Table<'_, &'static [u8], ()>,
    key: &HashKey,
) -> StoreResult<bool> {
    let Some(row) = get_row(&*mnodes, key)? else {
        return Ok(false);
    };
    mnodes.remove(key.as_bytes().as_slice())?;
    index.remove(time_key(row.update_time, key).as_slice())?;
    Ok(true)
}

/// Versioned metadata store
pub struct MnodeStore {
    backing: Backing,
    server_version: u64,
    startup_last_update_time: u64,
    entry_count: AtomicU64,
    batch_size: usize,
}

impl MnodeStore {
    /// Open the store and run startup recovery.
    ///
    /// The store generation is one past the highest generation found in the
    /// table, so rows written before this start read as `same_generation ==
    /// false`.
    pub fn open(backing: Backing) -> StoreResult<Self> {
        let (max_server_version, max_update_time, count) = backing.read(|txn| {
            let table = txn.open_table(tables::MNODE)?;
            let mut max_server_version = 0;
            let mut max_update_time = 0;
            for entry in table.iter()? {
                let (_, bytes) = entry?;
                let row = MnodeRow::decode(bytes.value())?;
                max_server_version = max_server_version.max(row.server_version);
                max_update_time = max_update_time.max(row.update_time);
            }
            Ok((max_server_version, max_update_time, table.len()?))
        })?;

        let store = Self {
            backing,
            server_version: max_server_version + 1,
            startup_last_update_time: max_update_time,
            entry_count: AtomicU64::new(count),
            batch_size: UPDATE_BATCH_SIZE,
        };
        info!(
            "mnode store opened: {} entries, server version {}, last update {}",
            count, store.server_version, store.startup_last_update_time
        );
        Ok(store)
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

    /// Highest update time present when the store was opened
    pub fn startup_last_update_time(&self) -> u64 {
        self.startup_last_update_time
    }

    /// Highest update time currently stored for one cache namespace
    pub fn startup_last_update_time_for(&self, cache: &HashKey) -> u64 {
        let result = self.backing.read(|txn| {
            let table = txn.open_table(tables::MNODE)?;
            let mut max = 0;
            for entry in table.iter()? {
                let (_, bytes) = entry?;
                let row = MnodeRow::decode(bytes.value())?;
                if row.cache_hash.as_ref() == Some(cache) {
                    max = max.max(row.update_time);
                }
            }
            Ok(max)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to scan last update time for cache {}: {}", cache.short(), e);
            0
        })
    }

    /// Number of rows in the table
    pub fn count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn load(&self, key: &HashKey) -> Option<MnodeEntry> {
        let now = self.backing.now();
        let result = self
            .backing
            .read(|txn| get_row(&txn.open_table(tables::MNODE)?, key));
        match result {
            Ok(row) => row.map(|row| MnodeEntry {
                value: row.value(),
                update_time: row.update_time,
                access_time: now,
                server_version: row.server_version,
                same_generation: row.server_version == self.server_version,
            }),
            Err(e) => {
                error!("Failed to load mnode {}: {}", key.short(), e);
                None
            }
        }
    }

    /// Create a row at exactly `update.version`. False if the key exists.
    pub fn insert(&self, key: &HashKey, update: &MnodeUpdate) -> bool {
        let now = self.backing.now();
        let result = self.backing.write(|txn| {
            if get_row(&txn.open_table(tables::MNODE)?, key)?.is_some() {
                return Ok(false);
            }
            let row = MnodeRow::new(update, update.version, self.server_version, now);
            put_row(txn, key, None, &row)?;
            Ok(true)
        });
        match result {
            Ok(inserted) => {
                if inserted {
                    self.entry_count.fetch_add(1, Ordering::Relaxed);
                    debug!("mnode insert {} v{}", key.short(), update.version);
                } else {
                    debug!("mnode insert {} lost to an existing row", key.short());
                }
                inserted
            }
            Err(e) => {
                error!("Failed to insert mnode {}: {}", key.short(), e);
                false
            }
        }
    }

    /// Replace the row's value when the caller's read version is still
    /// current.
    ///
    /// `update.version` is the version the caller read. The write succeeds
    /// when the stored version is at most that, and the row is stored at
    /// `update.version + 1`.
    pub fn update_save(&self, key: &HashKey, update: &MnodeUpdate) -> bool {
        let now = self.backing.now();
        let result = self.backing.write(|txn| {
            let Some(old) = get_row(&txn.open_table(tables::MNODE)?, key)? else {
                return Ok(false);
            };
            if old.version > update.version {
                return Ok(false);
            }
            let version = update.version.saturating_add(1);
            let row = MnodeRow::new(update, version, self.server_version, now);
            put_row(txn, key, Some(old.update_time), &row)?;
            Ok(true)
        });
        match result {
            Ok(saved) => {
                debug!("mnode update_save {} from v{}: {}", key.short(), update.version, saved);
                saved
            }
            Err(e) => {
                error!("Failed to update mnode {}: {}", key.short(), e);
                false
            }
        }
    }

    /// Refresh the idle clock of a row still at `version`
    pub fn update_update_time(
        &self,
        key: &HashKey,
        version: u64,
        access_timeout: u64,
        update_time: u64,
    ) -> bool {
        let result = self.backing.write(|txn| {
            let Some(old) = get_row(&txn.open_table(tables::MNODE)?, key)? else {
                return Ok(false);
            };
            if old.version != version {
                return Ok(false);
            }
            let row = MnodeRow {
                access_timeout,
                update_time,
                ..old.clone()
            };
            put_row(txn, key, Some(old.update_time), &row)?;
            Ok(true)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to refresh update time of mnode {}: {}", key.short(), e);
            false
        })
    }

    /// Stamp the current generation onto a row whose value is unchanged.
    ///
    /// Used to revalidate entries written before a restart.
    pub fn refresh_server_version(&self, key: &HashKey, value_hash: Option<HashKey>) -> bool {
        let now = self.backing.now();
        let result = self.backing.write(|txn| {
            let Some(old) = get_row(&txn.open_table(tables::MNODE)?, key)? else {
                return Ok(false);
            };
            if old.value_hash != value_hash {
                return Ok(false);
            }
            let row = MnodeRow {
                server_version: self.server_version,
                update_time: now,
                ..old.clone()
            };
            put_row(txn, key, Some(old.update_time), &row)?;
            Ok(true)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to refresh server version of mnode {}: {}", key.short(), e);
            false
        })
    }

    /// Delete the row outright
    pub fn remove(&self, key: &HashKey) -> bool {
        let result = self.backing.write(|txn| {
            let mut mnodes = txn.open_table(tables::MNODE)?;
            let mut index = txn.open_table(tables::MNODE_BY_UPDATE_TIME)?;
            delete_row(&mut mnodes, &mut index, key)
        });
        match result {
            Ok(removed) => {
                if removed {
                    self.entry_count.fetch_sub(1, Ordering::Relaxed);
                    debug!("mnode remove {}", key.short());
                }
                removed
            }
            Err(e) => {
                error!("Failed to remove mnode {}: {}", key.short(), e);
                false
            }
        }
    }

    /// Replicated rows updated at or after `since`, one page at `offset`
    pub fn updates_since(&self, since: u64, offset: usize) -> Vec<CacheData> {
        self.scan_updates(since, offset, |row| row.value().is_triplicate())
    }

    /// Rows of one cache namespace updated at or after `since`
    pub fn cache_updates_since(&self, cache: &HashKey, since: u64, offset: usize) -> Vec<CacheData> {
        self.scan_updates(since, offset, |row| row.cache_hash.as_ref() == Some(cache))
    }

    fn scan_updates(
        &self,
        since: u64,
        offset: usize,
        filter: impl Fn(&MnodeRow) -> bool,
    ) -> Vec<CacheData> {
        let result = self.backing.read(|txn| {
            let index = txn.open_table(tables::MNODE_BY_UPDATE_TIME)?;
            let mnodes = txn.open_table(tables::MNODE)?;
            let start = since.to_be_bytes();
            let mut skipped = 0;
            let mut page = Vec::new();
            for entry in index.range(start.as_slice()..)? {
                let (time_key, _) = entry?;
                let Some((_, key)) = split_time_key(time_key.value()) else {
                    continue;
                };
                let Some(row) = get_row(&mnodes, &key)? else {
                    continue;
                };
                if !filter(&row) {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                page.push(row.cache_data(key));
                if page.len() >= self.batch_size {
                    break;
                }
            }
            Ok(page)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to read change feed since {}: {}", since, e);
            Vec::new()
        })
    }

    /// Rows whose idle or absolute timeout has passed
    pub fn select_expired_data(&self) -> Vec<ExpiredMnode> {
        let now = self.backing.now();
        let result = self.backing.read(|txn| {
            let table = txn.open_table(tables::MNODE)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, bytes) = entry?;
                let row = MnodeRow::decode(bytes.value())?;
                if row.is_expired(now) {
                    expired.push(ExpiredMnode {
                        key: HashKey::from_slice(key.value())?,
                        value_hash: row.value_hash,
                        value_index: row.value_index,
                    });
                }
            }
            Ok(expired)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to scan expired mnodes: {}", e);
            Vec::new()
        })
    }

    /// Delete every expired row, returning how many were removed
    pub fn remove_expired_data(&self) -> usize {
        let now = self.backing.now();
        let result = self.backing.write(|txn| {
            let mut mnodes = txn.open_table(tables::MNODE)?;
            let mut index = txn.open_table(tables::MNODE_BY_UPDATE_TIME)?;
            let mut expired = Vec::new();
            for entry in mnodes.iter()? {
                let (key, bytes) = entry?;
                if MnodeRow::decode(bytes.value())?.is_expired(now) {
                    expired.push(HashKey::from_slice(key.value())?);
                }
            }
            let mut removed = 0;
            for key in &expired {
                if delete_row(&mut mnodes, &mut index, key)? {
                    removed += 1;
                }
            }
            Ok(removed)
        });
        match result {
            Ok(removed) => {
                if removed > 0 {
                    self.entry_count.fetch_sub(removed as u64, Ordering::Relaxed);
                    debug!("mnode store expired {} rows", removed);
                }
                removed
            }
            Err(e) => {
                error!("Failed to remove expired mnodes: {}", e);
                0
            }
        }
    }
}

impl std::fmt::Debug for MnodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MnodeStore")
            .field("server_version", &self.server_version)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::test_support::open_backing;
    use distcache_common::CachePolicy;
    use distcache_common::types::FLAG_TRIPLICATE;
    use std::sync::Arc;
    use std::time::Duration;

    fn h(s: &str) -> HashKey {
        HashKey::for_key(s)
    }

    fn replicated(value: &str, version: u64) -> MnodeValue {
        let policy = CachePolicy::named("c").with_flags(FLAG_TRIPLICATE);
        MnodeValue::with_policy(Some(h(value)), 5, version, &policy)
    }

    #[test]
    fn test_insert_update_and_stale_update() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let k1 = h("K1");

        assert!(store.insert(&k1, &MnodeValue::new(Some(h("H1")), 2, 1)));
        assert!(store.update_save(&k1, &MnodeValue::new(Some(h("H2")), 2, 1)));

        let loaded = store.load(&k1).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value_hash, Some(h("H2")));

        // Still holding version 1: rejected
        assert!(!store.update_save(&k1, &MnodeValue::new(Some(h("H3")), 2, 1)));
        let loaded = store.load(&k1).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value_hash, Some(h("H2")));
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let k = h("k");
        assert!(store.insert(&k, &MnodeValue::new(Some(h("a")), 1, 1)));
        assert!(!store.insert(&k, &MnodeValue::new(Some(h("b")), 1, 1)));
        assert_eq!(store.load(&k).unwrap().value_hash, Some(h("a")));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_update_save_missing_row() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        assert!(!store.update_save(&h("none"), &MnodeValue::new(Some(h("a")), 1, 1)));
    }

    #[test]
    fn test_tombstone_is_a_versioned_row() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let k = h("k");
        let live = replicated("v", 1);
        store.insert(&k, &live);
        assert!(store.update_save(&k, &MnodeValue::tombstone(1, &live)));

        let loaded = store.load(&k).unwrap();
        assert!(loaded.is_tombstone());
        assert_eq!(loaded.version, 2);

        let feed = store.updates_since(0, 0);
        assert_eq!(feed.len(), 1);
        assert!(feed[0].removed);
    }

    #[test]
    fn test_racing_update_saves_have_one_winner() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = Arc::new(MnodeStore::open(backing).unwrap());
        let k = h("k");
        store.insert(&k, &MnodeValue::new(Some(h("base")), 1, 3));

        let handles: Vec<_> = ["x", "y"]
            .into_iter()
            .map(|v| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.update_save(&k, &MnodeValue::new(Some(h(v)), 1, 3)))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(store.load(&k).unwrap().version, 4);
    }

    #[test]
    fn test_racing_inserts_converge() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = Arc::new(MnodeStore::open(backing).unwrap());
        let k = h("k");
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = ["x", "y"]
            .into_iter()
            .map(|v| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let inserted = store.insert(&k, &MnodeValue::new(Some(h(v)), 1, 1));
                    (v, inserted)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter(|(_, inserted)| *inserted).collect();
        assert_eq!(winners.len(), 1);
        let (winner, _) = winners[0];
        let (loser, _) = results.iter().find(|(_, inserted)| !*inserted).unwrap();

        let stored = store.load(&k).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.value_hash, Some(h(winner)));

        // The loser retries on top of the version it lost to
        assert!(store.update_save(&k, &MnodeValue::new(Some(h(loser)), 1, stored.version)));
        let stored = store.load(&k).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value_hash, Some(h(loser)));
        assert_eq!(store.count(), 1);

        // A retry based on the stale first version fails cleanly
        assert!(!store.update_save(&k, &MnodeValue::new(Some(h("late")), 1, 0)));
        assert_eq!(store.load(&k).unwrap().value_hash, Some(h(loser)));
    }

    #[test]
    fn test_update_update_time_requires_exact_version() {
        let (_dir, backing, clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let k = h("k");
        store.insert(&k, &MnodeValue::new(Some(h("a")), 1, 5));
        clock.advance(Duration::from_millis(500));

        assert!(!store.update_update_time(&k, 4, 100, 1500));
        assert!(store.update_update_time(&k, 5, 100, 1500));

        let loaded = store.load(&k).unwrap();
        assert_eq!(loaded.update_time, 1500);
        assert_eq!(loaded.access_timeout, 100);
        assert_eq!(loaded.version, 5);
    }

    #[test]
    fn test_remove_is_hard_delete() {
        let (_dir, backing, _clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let k = h("k");
        store.insert(&k, &replicated("v", 1));
        assert!(store.remove(&k));
        assert!(!store.remove(&k));
        assert!(store.load(&k).is_none());
        assert!(store.updates_since(0, 0).is_empty());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_updates_since_filters_and_orders() {
        let (_dir, backing, clock) = open_backing(100);
        let store = MnodeStore::open(backing).unwrap();

        store.insert(&h("a"), &replicated("va", 1));
        clock.set(200);
        store.insert(&h("local"), &MnodeValue::new(Some(h("vl")), 1, 1));
        store.insert(&h("b"), &replicated("vb", 1));
        clock.set(300);
        store.insert(&h("c"), &replicated("vc", 1));

        let feed = store.updates_since(200, 0);
        let keys: Vec<_> = feed.iter().map(|row| row.key).collect();
        assert_eq!(keys, vec![h("b"), h("c")]);
        assert!(feed.iter().all(|row| row.update_time >= 200));

        // Namespace scoping ignores the replication flag
        let named = store.cache_updates_since(&CachePolicy::named("c").cache_hash.unwrap(), 0, 0);
        assert_eq!(named.len(), 3);
        assert!(store.cache_updates_since(&h("other"), 0, 0).is_empty());
    }

    #[test]
    fn test_updates_since_pages() {
        let (_dir, backing, clock) = open_backing(0);
        let store = MnodeStore::open(backing).unwrap().with_batch_size(2);
        for i in 0..5 {
            clock.set(10 + i);
            store.insert(&h(&format!("k{i}")), &replicated("v", 1));
        }

        let first = store.updates_since(0, 0);
        let second = store.updates_since(0, 2);
        let third = store.updates_since(0, 4);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(third.len(), 1);
        assert_eq!(first[0].update_time, 10);
        assert_eq!(second[0].update_time, 12);
        assert_eq!(third[0].update_time, 14);
    }

    #[test]
    fn test_feed_consumer_crosses_tied_update_times() {
        let (_dir, backing, clock) = open_backing(0);
        let store = MnodeStore::open(backing).unwrap().with_batch_size(2);
        let mut written = std::collections::HashSet::new();
        clock.set(10);
        for i in 0..5 {
            let key = h(&format!("tied{i}"));
            store.insert(&key, &replicated("v", 1));
            written.insert(key);
        }
        clock.set(20);
        for i in 0..3 {
            let key = h(&format!("late{i}"));
            store.insert(&key, &replicated("v", 1));
            written.insert(key);
        }

        // Cursor alone cannot get past a full page of tied rows
        assert_eq!(store.updates_since(10, 0), store.updates_since(10, 0));

        let mut seen = std::collections::HashSet::new();
        let (mut cursor, mut offset) = (0, 0);
        for _ in 0..20 {
            let page = store.updates_since(cursor, offset);
            let Some(last) = page.last().map(|row| row.update_time) else {
                break;
            };
            assert!(page.len() <= 2);
            assert!(page.iter().all(|row| row.update_time >= cursor));
            seen.extend(page.iter().map(|row| row.key));

            let at_last = page.iter().filter(|row| row.update_time == last).count();
            if last == cursor {
                offset += at_last;
            } else {
                cursor = last;
                offset = at_last;
            }
        }

        assert_eq!(seen, written);
        assert!(store.updates_since(cursor, offset).is_empty());
    }

    #[test]
    fn test_update_moves_row_in_feed() {
        let (_dir, backing, clock) = open_backing(100);
        let store = MnodeStore::open(backing).unwrap();
        let k = h("k");
        store.insert(&k, &replicated("v1", 1));
        clock.set(500);
        store.update_save(&k, &replicated("v2", 1));

        assert_eq!(store.updates_since(0, 0).len(), 1);
        let feed = store.updates_since(400, 0);
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].version, 2);
        assert_eq!(feed[0].value_hash, Some(h("v2")));
    }

    #[test]
    fn test_expiry_scan_and_removal() {
        let (_dir, backing, clock) = open_backing(1000);
        let store = MnodeStore::open(backing).unwrap();
        let idle = CachePolicy::default().with_access_timeout(Duration::from_millis(400));
        let fixed = CachePolicy::default().with_modified_timeout(Duration::from_millis(2000));
        store.insert(&h("idle"), &MnodeValue::with_policy(Some(h("a")), 1, 1, &idle));
        store.insert(&h("fixed"), &MnodeValue::with_policy(Some(h("b")), 1, 1, &fixed));
        store.insert(&h("forever"), &MnodeValue::new(Some(h("c")), 1, 1));

        // idle expires after 1000 + 500
        clock.set(1500);
        assert!(store.select_expired_data().is_empty());
        clock.set(1501);
        let expired = store.select_expired_data();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, h("idle"));
        assert_eq!(expired[0].value_hash, Some(h("a")));

        clock.set(3001);
        assert_eq!(store.remove_expired_data(), 2);
        assert!(store.load(&h("fixed")).is_none());
        assert!(store.load(&h("forever")).is_some());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_recovery_bumps_server_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.redb");
        let clock = distcache_common::ManualClock::new(700);
        let k = h("k");
        {
            let store = MnodeStore::open(Backing::open(&path, clock.clone()).unwrap()).unwrap();
            assert_eq!(store.server_version(), 1);
            assert_eq!(store.startup_last_update_time(), 0);
            store.insert(&k, &replicated("v", 1));
            assert!(store.load(&k).unwrap().same_generation);
        }

        clock.set(900);
        let store = MnodeStore::open(Backing::open(&path, clock).unwrap()).unwrap();
        assert_eq!(store.server_version(), 2);
        assert_eq!(store.startup_last_update_time(), 700);
        assert_eq!(
            store.startup_last_update_time_for(&CachePolicy::named("c").cache_hash.unwrap()),
            700
        );
        assert_eq!(store.count(), 1);
        assert!(!store.load(&k).unwrap().same_generation);

        // Revalidation only applies while the value matches
        assert!(!store.refresh_server_version(&k, Some(h("other"))));
        assert!(store.refresh_server_version(&k, Some(h("v"))));
        let loaded = store.load(&k).unwrap();
        assert!(loaded.same_generation);
        assert_eq!(loaded.update_time, 900);
    }
}
