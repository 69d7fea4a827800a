//! Content-addressed value blob store.
//!
//! Blobs are keyed by the hash of their bytes, so writing the same content
//! twice is a no-op that only refreshes the blob's expiration. A blob stays
//! alive while some live metadata row references it: every sweep extends the
//! expiration of referenced blobs and then deletes the ones that lapsed.

use crate::backing::Backing;
use crate::error::StoreResult;
use crate::tables;
use crate::{map_backing, mnode_store};
use bytes::Bytes;
use distcache_common::HashKey;
use distcache_common::clock::millis;
use parking_lot::RwLock;
use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default lifetime of an unreferenced blob
pub const DEFAULT_EXPIRE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Notified about dangling references found by a sweep
pub trait OrphanListener: Send + Sync {
    /// A blob no live metadata row references
    fn on_orphan_value(&self, value_hash: &HashKey);

    /// A metadata row whose blob is gone
    fn on_missing_value(&self, key: &HashKey, value_hash: &HashKey) {
        let _ = (key, value_hash);
    }
}

/// Metadata table whose rows keep blobs alive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerTable {
    /// Split layout, [`crate::MnodeStore`]
    Mnode,
    /// Legacy layout, [`crate::CacheMapBacking`]
    CacheMap,
}

impl OwnerTable {
    fn live_value_refs(self, txn: &WriteTransaction, now: u64) -> StoreResult<Vec<(HashKey, HashKey)>> {
        match self {
            Self::Mnode => mnode_store::live_value_refs(&txn.open_table(tables::MNODE)?, now),
            Self::CacheMap => map_backing::live_value_refs(&txn.open_table(tables::CACHE_MAP)?, now),
        }
    }
}

/// Outcome of one blob sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Referenced blobs whose expiration was extended
    pub extended: usize,
    /// Metadata rows pointing at a blob that no longer exists
    pub missing: Vec<(HashKey, HashKey)>,
    /// Blobs no live metadata references
    pub orphans: Vec<HashKey>,
    /// Blobs deleted
    pub removed: usize,
}

/// Content-addressed blob store
pub struct DataStore {
    backing: Backing,
    owners: OwnerTable,
    expire_timeout: u64,
    listeners: RwLock<Vec<Arc<dyn OrphanListener>>>,
}

impl DataStore {
    pub fn new(backing: Backing, owners: OwnerTable) -> Self {
        Self {
            backing,
            owners,
            expire_timeout: millis(DEFAULT_EXPIRE_TIMEOUT),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_expire_timeout(mut self, timeout: Duration) -> Self {
        self.expire_timeout = millis(timeout);
        self
    }

    pub fn expire_timeout(&self) -> Duration {
        Duration::from_millis(self.expire_timeout)
    }

    pub fn add_orphan_listener(&self, listener: Arc<dyn OrphanListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_orphan_listener(&self, listener: &Arc<dyn OrphanListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Store a blob. An existing blob with the same hash only has its
    /// expiration refreshed.
    pub fn save(&self, hash: &HashKey, data: &[u8]) -> bool {
        let expires = self.backing.now().saturating_add(self.expire_timeout);
        let result = self.backing.write(|txn| {
            let mut expiry = txn.open_table(tables::DATA_EXPIRES)?;
            let exists = expiry.get(hash.as_bytes().as_slice())?.is_some();
            expiry.insert(hash.as_bytes().as_slice(), expires)?;
            if !exists {
                txn.open_table(tables::DATA)?
                    .insert(hash.as_bytes().as_slice(), data)?;
            }
            Ok(exists)
        });
        match result {
            Ok(existed) => {
                debug!(
                    "data save {} ({} bytes, {})",
                    hash.short(),
                    data.len(),
                    if existed { "refreshed" } else { "new" }
                );
                true
            }
            Err(e) => {
                error!("Failed to save data {}: {}", hash.short(), e);
                false
            }
        }
    }

    /// Store a blob read from a stream of exactly `length` bytes
    pub fn save_stream(&self, hash: &HashKey, reader: &mut impl Read, length: u64) -> bool {
        let mut data = Vec::new();
        match reader.take(length).read_to_end(&mut data) {
            Ok(n) if n as u64 == length => self.save(hash, &data),
            Ok(n) => {
                warn!("Short read saving data {}: {} of {} bytes", hash.short(), n, length);
                false
            }
            Err(e) => {
                error!("Failed to read data {}: {}", hash.short(), e);
                false
            }
        }
    }

    /// Copy a blob into `sink`. False when absent.
    pub fn load(&self, hash: &HashKey, sink: &mut impl Write) -> bool {
        match self.load_bytes(hash) {
            Some(data) => match sink.write_all(&data) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to write data {} to sink: {}", hash.short(), e);
                    false
                }
            },
            None => false,
        }
    }

    pub fn load_bytes(&self, hash: &HashKey) -> Option<Bytes> {
        let result = self.backing.read(|txn| {
            Ok(txn
                .open_table(tables::DATA)?
                .get(hash.as_bytes().as_slice())?
                .map(|guard| Bytes::copy_from_slice(guard.value())))
        });
        result.unwrap_or_else(|e| {
            error!("Failed to load data {}: {}", hash.short(), e);
            None
        })
    }

    pub fn is_data_available(&self, hash: &HashKey) -> bool {
        let result = self.backing.read(|txn| {
            Ok(txn
                .open_table(tables::DATA_EXPIRES)?
                .get(hash.as_bytes().as_slice())?
                .is_some())
        });
        result.unwrap_or_else(|e| {
            error!("Failed to check data {}: {}", hash.short(), e);
            false
        })
    }

    /// Push an existing blob's expiration out by the full timeout
    pub fn update_expires(&self, hash: &HashKey) -> bool {
        let expires = self.backing.now().saturating_add(self.expire_timeout);
        let result = self.backing.write(|txn| {
            let mut expiry = txn.open_table(tables::DATA_EXPIRES)?;
            if expiry.get(hash.as_bytes().as_slice())?.is_none() {
                return Ok(false);
            }
            expiry.insert(hash.as_bytes().as_slice(), expires)?;
            Ok(true)
        });
        result.unwrap_or_else(|e| {
            error!("Failed to update expiration of data {}: {}", hash.short(), e);
            false
        })
    }

    /// Number of stored blobs
    pub fn count(&self) -> u64 {
        let result = self
            .backing
            .read(|txn| Ok(txn.open_table(tables::DATA_EXPIRES)?.len()?));
        result.unwrap_or_else(|e| {
            error!("Failed to count data: {}", e);
            0
        })
    }

    /// Extend referenced blobs, report dangling references, then delete
    /// blobs whose expiration has passed.
    pub fn remove_expired_data(&self) -> SweepReport {
        let now = self.backing.now();
        let expires = now.saturating_add(self.expire_timeout);
        let result = self.backing.write(|txn| {
            let refs = self.owners.live_value_refs(txn, now)?;
            let mut report = SweepReport::default();
            let mut expiry = txn.open_table(tables::DATA_EXPIRES)?;

            let mut referenced = HashSet::new();
            for (key, value_hash) in refs {
                if referenced.contains(&value_hash) {
                    continue;
                }
                if expiry.get(value_hash.as_bytes().as_slice())?.is_some() {
                    expiry.insert(value_hash.as_bytes().as_slice(), expires)?;
                    referenced.insert(value_hash);
                    report.extended += 1;
                } else {
                    report.missing.push((key, value_hash));
                }
            }

            let mut lapsed = Vec::new();
            for entry in expiry.iter()? {
                let (hash, expire_time) = entry?;
                let hash = HashKey::from_slice(hash.value())?;
                if !referenced.contains(&hash) {
                    report.orphans.push(hash);
                }
                if expire_time.value() < now {
                    lapsed.push(hash);
                }
            }

            let mut data = txn.open_table(tables::DATA)?;
            for hash in &lapsed {
                expiry.remove(hash.as_bytes().as_slice())?;
                data.remove(hash.as_bytes().as_slice())?;
            }
            report.removed = lapsed.len();
            Ok(report)
        });

        match result {
            Ok(report) => {
                self.notify(&report);
                if report.removed > 0 || !report.missing.is_empty() {
                    debug!(
                        "data sweep: extended {}, removed {}, orphans {}, missing {}",
                        report.extended,
                        report.removed,
                        report.orphans.len(),
                        report.missing.len()
                    );
                }
                report
            }
            Err(e) => {
                error!("Failed to remove expired data: {}", e);
                SweepReport::default()
            }
        }
    }

    fn notify(&self, report: &SweepReport) {
        for (key, value_hash) in &report.missing {
            warn!("mnode {} references missing data {}", key.short(), value_hash.short());
        }
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            return;
        }
        for (key, value_hash) in &report.missing {
            for listener in listeners.iter() {
                listener.on_missing_value(key, value_hash);
            }
        }
        for hash in &report.orphans {
            for listener in listeners.iter() {
                listener.on_orphan_value(hash);
            }
        }
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("owners", &self.owners)
            .field("expire_timeout", &self.expire_timeout)
            .finish_non_exhaustive()
    }
}
